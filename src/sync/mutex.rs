use std::sync::Arc;

use crate::{
    error::Error,
    grant::Grant,
    queue::{Acquirable, Acquire, Batch, DEFAULT_MAX_CONSECUTIVE, Slot, WaitList, Waiter},
    token::CancellationToken,
};

struct MutexState {
    locked: bool,
    queue: WaitList,
    batch: Batch,
    drain_deferred: bool,
}

struct MutexInner {
    state: parking_lot::Mutex<MutexState>,
}

impl MutexInner {
    fn unlock(&self) {
        let mut state = self.state.lock();
        state.locked = false;
        Self::drain(&mut state);
    }

    /// Grants the head of the queue when the lock is free, bounded by the
    /// batch budget for this turn.
    fn drain(state: &mut MutexState) {
        loop {
            if state.batch.exhausted() {
                if !state.queue.is_empty() {
                    state.drain_deferred = true;
                    state.queue.rouse_front();
                }
                break;
            }
            if state.locked {
                break;
            }
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            state.batch.count();
            if waiter.grant() {
                state.locked = true;
            }
            // A lost race means the entry was cancelled in place; the skip
            // still counts against the batch.
        }
    }
}

fn lock_grant(inner: &Arc<MutexInner>) -> Grant {
    let owner = Arc::downgrade(inner);
    Grant::new(move || {
        if let Some(inner) = owner.upgrade() {
            inner.unlock();
        }
    })
}

struct MutexSlot(Arc<MutexInner>);

impl Slot for MutexSlot {
    fn detach(&self, waiter: &Arc<Waiter>) {
        let mut state = self.0.state.lock();
        state.queue.remove(waiter);
        MutexInner::drain(&mut state);
    }

    fn redrain(&self) {
        let mut state = self.0.state.lock();
        if state.drain_deferred {
            state.drain_deferred = false;
            MutexInner::drain(&mut state);
        }
    }

    fn make_grant(&self) -> Grant {
        lock_grant(&self.0)
    }

    fn forfeit(&self) {
        self.0.unlock();
    }

    fn cancel_error(&self) -> Error {
        Error::AcquireCancelled
    }
}

/// Exclusive asynchronous lock.
///
/// Holds no data: [`lock`](Mutex::lock) suspends until the lock is free and
/// resolves to a [`Grant`] whose release (explicit or on drop) unlocks.
/// Waiters are granted strictly first-come-first-served, and at most one
/// grant is outstanding at any time.
///
/// Locking is not reentrant: a task awaiting `lock` while it already holds
/// the grant deadlocks.
///
/// # Cloning
///
/// Clones share the lock state.
///
/// # Example
///
/// ```
/// use insieme::Mutex;
///
/// # async fn example() {
/// let mutex = Mutex::new();
/// let grant = mutex.lock().await.unwrap();
/// assert!(mutex.is_locked());
/// drop(grant); // unlocks
/// # }
/// ```
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Mutex {
    /// A fresh, unlocked mutex with the default batch bound.
    pub fn new() -> Self {
        Self::with_max_consecutive(DEFAULT_MAX_CONSECUTIVE)
    }

    /// A fresh mutex granting at most `max_consecutive` queued requests per
    /// drain episode before yielding to the scheduler. Values below 1 are
    /// clamped to 1.
    pub fn with_max_consecutive(max_consecutive: usize) -> Self {
        Self {
            inner: Arc::new(MutexInner {
                state: parking_lot::Mutex::new(MutexState {
                    locked: false,
                    queue: WaitList::default(),
                    batch: Batch::new(max_consecutive),
                    drain_deferred: false,
                }),
            }),
        }
    }

    /// Acquires the lock, suspending while it is held or while earlier
    /// requests are queued.
    pub fn lock(&self) -> Acquire {
        self.begin_acquire(None)
    }

    /// Like [`lock`](Self::lock), rejecting with
    /// [`Error::AcquireCancelled`] if the token fires first.
    pub fn lock_with(&self, token: &CancellationToken) -> Acquire {
        self.begin_acquire(Some(token))
    }

    /// Immediate path only: takes the lock if it is free and nobody is
    /// queued, without ever suspending.
    pub fn try_lock(&self) -> Option<Grant> {
        let mut state = self.inner.state.lock();
        if state.locked || !state.queue.is_empty() {
            return None;
        }
        state.locked = true;
        drop(state);
        Some(lock_grant(&self.inner))
    }

    /// Whether a grant is currently outstanding.
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().locked
    }

    /// Number of queued requests.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Acquirable for Mutex {
    fn begin_acquire(&self, token: Option<&CancellationToken>) -> Acquire {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Acquire::settled(Err(Error::AcquireCancelled));
        }
        let mut state = self.inner.state.lock();
        if !state.locked && state.queue.is_empty() {
            state.locked = true;
            drop(state);
            return Acquire::settled(Ok(lock_grant(&self.inner)));
        }
        let waiter = Waiter::new();
        state.queue.push_back(Arc::clone(&waiter));
        drop(state);
        let slot: Arc<dyn Slot> = Arc::new(MutexSlot(Arc::clone(&self.inner)));
        Acquire::queued(waiter, slot, token)
    }

    fn prepare_acquire(&self, token: Option<&CancellationToken>) -> Option<Acquire> {
        Some(self.begin_acquire(token))
    }
}
