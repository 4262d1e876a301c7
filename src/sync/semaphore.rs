use std::sync::Arc;

use crate::{
    error::Error,
    grant::Grant,
    queue::{Acquirable, Acquire, Batch, DEFAULT_MAX_CONSECUTIVE, Slot, WaitList, Waiter},
    token::CancellationToken,
};

struct SemaphoreState {
    available: usize,
    queue: WaitList,
    batch: Batch,
    drain_deferred: bool,
}

struct SemaphoreInner {
    capacity: usize,
    state: parking_lot::Mutex<SemaphoreState>,
}

impl SemaphoreInner {
    fn return_permit(&self) {
        let mut state = self.state.lock();
        state.available += 1;
        debug_assert!(state.available <= self.capacity);
        Self::drain(&mut state);
    }

    /// Grants queued requests while permits remain, bounded by the batch
    /// budget for this turn.
    fn drain(state: &mut SemaphoreState) {
        loop {
            if state.batch.exhausted() {
                if !state.queue.is_empty() {
                    state.drain_deferred = true;
                    state.queue.rouse_front();
                }
                break;
            }
            if state.available == 0 {
                break;
            }
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.batch.count();
            if waiter.grant() {
                state.available -= 1;
            }
        }
    }
}

fn permit_grant(inner: &Arc<SemaphoreInner>) -> Grant {
    let owner = Arc::downgrade(inner);
    Grant::new(move || {
        if let Some(inner) = owner.upgrade() {
            inner.return_permit();
        }
    })
}

struct SemaphoreSlot(Arc<SemaphoreInner>);

impl Slot for SemaphoreSlot {
    fn detach(&self, waiter: &Arc<Waiter>) {
        let mut state = self.0.state.lock();
        state.queue.remove(waiter);
        SemaphoreInner::drain(&mut state);
    }

    fn redrain(&self) {
        let mut state = self.0.state.lock();
        if state.drain_deferred {
            state.drain_deferred = false;
            SemaphoreInner::drain(&mut state);
        }
    }

    fn make_grant(&self) -> Grant {
        permit_grant(&self.0)
    }

    fn forfeit(&self) {
        self.0.return_permit();
    }

    fn cancel_error(&self) -> Error {
        Error::AcquireCancelled
    }
}

/// Counting resource pool.
///
/// Hands out up to `capacity` concurrent [`Grant`]s; further acquirers queue
/// in FIFO order and are granted as permits return. `available +
/// outstanding == capacity` at every observable point.
///
/// # Cloning
///
/// Clones share the pool.
///
/// # Example
///
/// ```
/// use insieme::Semaphore;
///
/// # async fn example() {
/// let pool = Semaphore::new(2).unwrap();
/// let first = pool.acquire().await.unwrap();
/// let second = pool.acquire().await.unwrap();
/// assert_eq!(pool.available_count(), 0);
/// drop(first); // a third acquirer may proceed now
/// # }
/// ```
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore").finish_non_exhaustive()
    }
}

impl Semaphore {
    /// A pool of `capacity` permits with the default batch bound.
    ///
    /// Fails with [`Error::InvalidCapacity`] when `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        Self::with_max_consecutive(capacity, DEFAULT_MAX_CONSECUTIVE)
    }

    /// A pool granting at most `max_consecutive` queued requests per drain
    /// episode before yielding to the scheduler. Values below 1 are clamped
    /// to 1.
    pub fn with_max_consecutive(capacity: usize, max_consecutive: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        Ok(Self {
            inner: Arc::new(SemaphoreInner {
                capacity,
                state: parking_lot::Mutex::new(SemaphoreState {
                    available: capacity,
                    queue: WaitList::default(),
                    batch: Batch::new(max_consecutive),
                    drain_deferred: false,
                }),
            }),
        })
    }

    /// Acquires one permit, suspending while none is available or while
    /// earlier requests are queued.
    pub fn acquire(&self) -> Acquire {
        self.begin_acquire(None)
    }

    /// Like [`acquire`](Self::acquire), rejecting with
    /// [`Error::AcquireCancelled`] if the token fires first.
    pub fn acquire_with(&self, token: &CancellationToken) -> Acquire {
        self.begin_acquire(Some(token))
    }

    /// Immediate path only: takes a permit if one is free and nobody is
    /// queued, without ever suspending.
    pub fn try_acquire(&self) -> Option<Grant> {
        let mut state = self.inner.state.lock();
        if state.available == 0 || !state.queue.is_empty() {
            return None;
        }
        state.available -= 1;
        drop(state);
        Some(permit_grant(&self.inner))
    }

    /// Permits not currently granted.
    pub fn available_count(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Number of queued requests.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Total permit count the pool was built with.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Acquirable for Semaphore {
    fn begin_acquire(&self, token: Option<&CancellationToken>) -> Acquire {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Acquire::settled(Err(Error::AcquireCancelled));
        }
        let mut state = self.inner.state.lock();
        if state.available > 0 && state.queue.is_empty() {
            state.available -= 1;
            drop(state);
            return Acquire::settled(Ok(permit_grant(&self.inner)));
        }
        let waiter = Waiter::new();
        state.queue.push_back(Arc::clone(&waiter));
        drop(state);
        let slot: Arc<dyn Slot> = Arc::new(SemaphoreSlot(Arc::clone(&self.inner)));
        Acquire::queued(waiter, slot, token)
    }

    fn prepare_acquire(&self, token: Option<&CancellationToken>) -> Option<Acquire> {
        Some(self.begin_acquire(token))
    }
}
