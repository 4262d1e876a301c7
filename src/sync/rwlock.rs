use std::sync::Arc;

use crate::{
    error::Error,
    grant::Grant,
    queue::{Acquirable, Acquire, Batch, DEFAULT_MAX_CONSECUTIVE, Slot, WaitList, Waiter},
    token::CancellationToken,
};

/// Queue preference when readers and writers are both waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RwPolicy {
    /// Queued writers block new read grants; a writer goes first once the
    /// lock runs dry, then all queued readers are granted together.
    #[default]
    WritePreferring,
    /// Queued readers are granted whenever no writer is active; writers wait
    /// for a fully idle lock (and can starve under a steady read load).
    ReadPreferring,
}

/// Constructor options for [`RwLock`].
#[derive(Debug, Clone, Copy)]
pub struct RwLockOptions {
    pub policy: RwPolicy,
    /// Bound on consecutive grants per drain episode; values below 1 are
    /// clamped to 1.
    pub max_consecutive: usize,
}

impl Default for RwLockOptions {
    fn default() -> Self {
        Self {
            policy: RwPolicy::default(),
            max_consecutive: DEFAULT_MAX_CONSECUTIVE,
        }
    }
}

struct RwState {
    readers: usize,
    writer: bool,
    read_queue: WaitList,
    write_queue: WaitList,
    batch: Batch,
    drain_deferred: bool,
}

impl RwState {
    fn idle(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

struct RwInner {
    policy: RwPolicy,
    state: parking_lot::Mutex<RwState>,
}

impl RwInner {
    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.drain(&mut state);
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.drain(&mut state);
    }

    /// Immediate-path predicate for a read grant; mirrors one drain step.
    fn can_read_now(&self, state: &RwState) -> bool {
        match self.policy {
            RwPolicy::WritePreferring => !state.writer && state.write_queue.is_empty(),
            RwPolicy::ReadPreferring => !state.writer,
        }
    }

    /// Immediate-path predicate for a write grant. Writers never overtake
    /// queued writers, nor (under read preference) queued readers.
    fn can_write_now(&self, state: &RwState) -> bool {
        let no_queue_ahead = match self.policy {
            RwPolicy::WritePreferring => state.write_queue.is_empty(),
            RwPolicy::ReadPreferring => {
                state.write_queue.is_empty() && state.read_queue.is_empty()
            }
        };
        state.idle() && no_queue_ahead
    }

    /// Grants whichever queue the policy prefers until nothing is eligible
    /// or the batch budget for this turn is spent. Reader grants batch up:
    /// every queued reader eligible under the policy goes in one episode.
    fn drain(&self, state: &mut RwState) {
        loop {
            if state.batch.exhausted() {
                if !state.read_queue.is_empty() || !state.write_queue.is_empty() {
                    state.drain_deferred = true;
                    state.read_queue.rouse_front();
                    state.write_queue.rouse_front();
                }
                break;
            }
            let grant_write = match self.policy {
                RwPolicy::WritePreferring => {
                    if state.idle() && !state.write_queue.is_empty() {
                        true
                    } else if !state.writer
                        && state.write_queue.is_empty()
                        && !state.read_queue.is_empty()
                    {
                        false
                    } else {
                        break;
                    }
                }
                RwPolicy::ReadPreferring => {
                    if !state.writer && !state.read_queue.is_empty() {
                        false
                    } else if state.idle() && !state.write_queue.is_empty() {
                        true
                    } else {
                        break;
                    }
                }
            };
            if grant_write {
                let Some(waiter) = state.write_queue.pop_front() else {
                    break;
                };
                state.batch.count();
                if waiter.grant() {
                    state.writer = true;
                }
            } else {
                let Some(waiter) = state.read_queue.pop_front() else {
                    break;
                };
                state.batch.count();
                if waiter.grant() {
                    state.readers += 1;
                }
            }
        }
    }

    fn redrain(&self) {
        let mut state = self.state.lock();
        if state.drain_deferred {
            state.drain_deferred = false;
            self.drain(&mut state);
        }
    }
}

fn read_grant(inner: &Arc<RwInner>) -> Grant {
    let owner = Arc::downgrade(inner);
    Grant::new(move || {
        if let Some(inner) = owner.upgrade() {
            inner.release_read();
        }
    })
}

fn write_grant(inner: &Arc<RwInner>) -> Grant {
    let owner = Arc::downgrade(inner);
    Grant::new(move || {
        if let Some(inner) = owner.upgrade() {
            inner.release_write();
        }
    })
}

struct ReadSlot(Arc<RwInner>);

impl Slot for ReadSlot {
    fn detach(&self, waiter: &Arc<Waiter>) {
        let mut state = self.0.state.lock();
        state.read_queue.remove(waiter);
        self.0.drain(&mut state);
    }

    fn redrain(&self) {
        self.0.redrain();
    }

    fn make_grant(&self) -> Grant {
        read_grant(&self.0)
    }

    fn forfeit(&self) {
        self.0.release_read();
    }

    fn cancel_error(&self) -> Error {
        Error::AcquireCancelled
    }
}

struct WriteSlot(Arc<RwInner>);

impl Slot for WriteSlot {
    fn detach(&self, waiter: &Arc<Waiter>) {
        let mut state = self.0.state.lock();
        state.write_queue.remove(waiter);
        // Removing a queued writer can make queued readers eligible.
        self.0.drain(&mut state);
    }

    fn redrain(&self) {
        self.0.redrain();
    }

    fn make_grant(&self) -> Grant {
        write_grant(&self.0)
    }

    fn forfeit(&self) {
        self.0.release_write();
    }

    fn cancel_error(&self) -> Error {
        Error::AcquireCancelled
    }
}

/// Shared-read / exclusive-write asynchronous lock.
///
/// Any number of read grants may be outstanding together; a write grant is
/// exclusive against both readers and other writers. Which side goes first
/// when both are waiting is decided by the [`RwPolicy`] chosen at
/// construction (write-preferring by default).
///
/// There is no upgrade path: a task requesting a write grant while it still
/// holds a read grant deadlocks, by design. Repeated read acquisitions are
/// not tracked per caller; each is an independent grant.
///
/// # Cloning
///
/// Clones share the lock state.
#[derive(Clone)]
pub struct RwLock {
    inner: Arc<RwInner>,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    /// A fresh, idle lock: write-preferring, default batch bound.
    pub fn new() -> Self {
        Self::with_options(RwLockOptions::default())
    }

    /// A fresh lock with the given queue preference.
    pub fn with_policy(policy: RwPolicy) -> Self {
        Self::with_options(RwLockOptions {
            policy,
            ..RwLockOptions::default()
        })
    }

    /// A fresh write-preferring lock with a custom batch bound.
    pub fn with_max_consecutive(max_consecutive: usize) -> Self {
        Self::with_options(RwLockOptions {
            max_consecutive,
            ..RwLockOptions::default()
        })
    }

    /// A fresh lock with full options.
    pub fn with_options(options: RwLockOptions) -> Self {
        Self {
            inner: Arc::new(RwInner {
                policy: options.policy,
                state: parking_lot::Mutex::new(RwState {
                    readers: 0,
                    writer: false,
                    read_queue: WaitList::default(),
                    write_queue: WaitList::default(),
                    batch: Batch::new(options.max_consecutive),
                    drain_deferred: false,
                }),
            }),
        }
    }

    /// Acquires a shared read grant.
    pub fn read(&self) -> Acquire {
        self.acquire_read(None)
    }

    /// Like [`read`](Self::read), rejecting with
    /// [`Error::AcquireCancelled`] if the token fires first.
    pub fn read_with(&self, token: &CancellationToken) -> Acquire {
        self.acquire_read(Some(token))
    }

    /// Acquires the exclusive write grant.
    pub fn write(&self) -> Acquire {
        self.acquire_write(None)
    }

    /// Like [`write`](Self::write), rejecting with
    /// [`Error::AcquireCancelled`] if the token fires first.
    pub fn write_with(&self, token: &CancellationToken) -> Acquire {
        self.acquire_write(Some(token))
    }

    /// Immediate path only: takes a read grant if the policy would grant one
    /// right now, without ever suspending.
    pub fn try_read(&self) -> Option<Grant> {
        let mut state = self.inner.state.lock();
        if !self.inner.can_read_now(&state) {
            return None;
        }
        state.readers += 1;
        drop(state);
        Some(read_grant(&self.inner))
    }

    /// Immediate path only: takes the write grant if the lock is idle and no
    /// eligible queue is ahead, without ever suspending.
    pub fn try_write(&self) -> Option<Grant> {
        let mut state = self.inner.state.lock();
        if !self.inner.can_write_now(&state) {
            return None;
        }
        state.writer = true;
        drop(state);
        Some(write_grant(&self.inner))
    }

    /// The read half as an acquisition target (for trigger-and-wait).
    pub fn reader(&self) -> RwReader<'_> {
        RwReader(self)
    }

    /// The write half as an acquisition target (for trigger-and-wait).
    pub fn writer(&self) -> RwWriter<'_> {
        RwWriter(self)
    }

    /// Number of read grants currently outstanding.
    pub fn current_readers(&self) -> usize {
        self.inner.state.lock().readers
    }

    /// Whether the write grant is currently outstanding.
    pub fn has_writer(&self) -> bool {
        self.inner.state.lock().writer
    }

    /// Number of queued read requests.
    pub fn pending_readers_count(&self) -> usize {
        self.inner.state.lock().read_queue.len()
    }

    /// Number of queued write requests.
    pub fn pending_writers_count(&self) -> usize {
        self.inner.state.lock().write_queue.len()
    }

    /// The queue preference chosen at construction.
    pub fn policy(&self) -> RwPolicy {
        self.inner.policy
    }

    fn acquire_read(&self, token: Option<&CancellationToken>) -> Acquire {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Acquire::settled(Err(Error::AcquireCancelled));
        }
        let mut state = self.inner.state.lock();
        if self.inner.can_read_now(&state) {
            state.readers += 1;
            drop(state);
            return Acquire::settled(Ok(read_grant(&self.inner)));
        }
        let waiter = Waiter::new();
        state.read_queue.push_back(Arc::clone(&waiter));
        drop(state);
        let slot: Arc<dyn Slot> = Arc::new(ReadSlot(Arc::clone(&self.inner)));
        Acquire::queued(waiter, slot, token)
    }

    fn acquire_write(&self, token: Option<&CancellationToken>) -> Acquire {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Acquire::settled(Err(Error::AcquireCancelled));
        }
        let mut state = self.inner.state.lock();
        if self.inner.can_write_now(&state) {
            state.writer = true;
            drop(state);
            return Acquire::settled(Ok(write_grant(&self.inner)));
        }
        let waiter = Waiter::new();
        state.write_queue.push_back(Arc::clone(&waiter));
        drop(state);
        let slot: Arc<dyn Slot> = Arc::new(WriteSlot(Arc::clone(&self.inner)));
        Acquire::queued(waiter, slot, token)
    }
}

/// The read half of an [`RwLock`], usable wherever an [`Acquirable`] target
/// is expected.
pub struct RwReader<'a>(&'a RwLock);

impl Acquirable for RwReader<'_> {
    fn begin_acquire(&self, token: Option<&CancellationToken>) -> Acquire {
        self.0.acquire_read(token)
    }

    fn prepare_acquire(&self, token: Option<&CancellationToken>) -> Option<Acquire> {
        Some(self.0.acquire_read(token))
    }
}

/// The write half of an [`RwLock`], usable wherever an [`Acquirable`] target
/// is expected.
pub struct RwWriter<'a>(&'a RwLock);

impl Acquirable for RwWriter<'_> {
    fn begin_acquire(&self, token: Option<&CancellationToken>) -> Acquire {
        self.0.acquire_write(token)
    }

    fn prepare_acquire(&self, token: Option<&CancellationToken>) -> Option<Acquire> {
        Some(self.0.acquire_write(token))
    }
}

#[cfg(test)]
mod tests {
    use std::task::{Context, Poll};

    use assert_matches::assert_matches;

    use super::*;

    fn ready_grant(poll: Poll<Result<Grant, Error>>) -> Grant {
        match poll {
            Poll::Ready(Ok(grant)) => grant,
            other => panic!("expected a grant, got {other:?}"),
        }
    }

    /// Shared reads coexist; the writer excludes everything. Identical under
    /// both policies.
    macro_rules! exclusion_tests {
        ($($policy:ident),* $(,)?) => {
            paste::paste! {
                $(
                    #[tokio::test]
                    async fn [<test_exclusion_ $policy:snake>]() {
                        let lock = RwLock::with_policy(RwPolicy::$policy);

                        let first = lock.read().await.unwrap();
                        let second = lock.read().await.unwrap();
                        assert_eq!(lock.current_readers(), 2);
                        assert!(!lock.has_writer());
                        assert!(lock.try_write().is_none());

                        drop(first);
                        drop(second);
                        let writer = lock.write().await.unwrap();
                        assert!(lock.has_writer());
                        assert_eq!(lock.current_readers(), 0);
                        assert!(lock.try_read().is_none());
                        assert!(lock.try_write().is_none());

                        drop(writer);
                        assert!(!lock.has_writer());
                    }
                )*
            }
        };
    }

    exclusion_tests!(WritePreferring, ReadPreferring);

    /// Write-preferring: a queued writer goes first once the last reader
    /// releases, then the queued readers are granted together.
    #[tokio::test]
    async fn test_write_preferring_order() {
        let lock = RwLock::new();
        let held = lock.read().await.unwrap();

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);

        let mut write_first = Box::pin(lock.write());
        assert_matches!(write_first.as_mut().poll(&mut context), Poll::Pending);

        // The queued writer now blocks fresh readers.
        let mut read_second = Box::pin(lock.read());
        let mut read_third = Box::pin(lock.read());
        assert_matches!(read_second.as_mut().poll(&mut context), Poll::Pending);
        assert_matches!(read_third.as_mut().poll(&mut context), Poll::Pending);
        assert_eq!(lock.pending_writers_count(), 1);
        assert_eq!(lock.pending_readers_count(), 2);

        drop(held);
        let write = ready_grant(write_first.as_mut().poll(&mut context));
        // Readers stay parked behind the active writer.
        assert_matches!(read_second.as_mut().poll(&mut context), Poll::Pending);

        drop(write);
        let _second = ready_grant(read_second.as_mut().poll(&mut context));
        let _third = ready_grant(read_third.as_mut().poll(&mut context));
        assert_eq!(lock.current_readers(), 2);
    }

    /// Read-preferring: all queued readers are granted together when the
    /// writer releases; the queued writer waits for every one of them.
    #[tokio::test]
    async fn test_read_preferring_order() {
        let lock = RwLock::with_policy(RwPolicy::ReadPreferring);
        let held = lock.write().await.unwrap();

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);

        let mut read_first = Box::pin(lock.read());
        let mut read_second = Box::pin(lock.read());
        let mut write_queued = Box::pin(lock.write());
        let mut read_third = Box::pin(lock.read());
        assert_matches!(read_first.as_mut().poll(&mut context), Poll::Pending);
        assert_matches!(read_second.as_mut().poll(&mut context), Poll::Pending);
        assert_matches!(write_queued.as_mut().poll(&mut context), Poll::Pending);
        assert_matches!(read_third.as_mut().poll(&mut context), Poll::Pending);

        drop(held);
        let first = ready_grant(read_first.as_mut().poll(&mut context));
        let second = ready_grant(read_second.as_mut().poll(&mut context));
        let third = ready_grant(read_third.as_mut().poll(&mut context));
        assert_eq!(lock.current_readers(), 3);
        assert_matches!(write_queued.as_mut().poll(&mut context), Poll::Pending);

        drop(first);
        drop(second);
        assert_matches!(write_queued.as_mut().poll(&mut context), Poll::Pending);
        drop(third);
        let _write = ready_grant(write_queued.as_mut().poll(&mut context));
        assert!(lock.has_writer());
    }

    /// Read-preferring lets fresh readers in past a queued writer.
    #[tokio::test]
    async fn test_read_preferring_barging() {
        let lock = RwLock::with_policy(RwPolicy::ReadPreferring);
        let held = lock.read().await.unwrap();

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        let mut write_queued = Box::pin(lock.write());
        assert_matches!(write_queued.as_mut().poll(&mut context), Poll::Pending);

        // New readers still pass.
        let late = lock.read().await.unwrap();
        assert_eq!(lock.current_readers(), 2);

        drop(held);
        drop(late);
        assert_matches!(write_queued.as_mut().poll(&mut context), Poll::Ready(Ok(_)));
    }

    /// Cancelling the only queued writer lets queued readers through
    /// (write-preferring).
    #[tokio::test]
    async fn test_cancelled_writer_unblocks_readers() {
        let lock = RwLock::new();
        let held = lock.read().await.unwrap();

        let token = CancellationToken::new();
        let write_queued = lock.write_with(&token);
        let read_queued = lock.read();
        assert_eq!(lock.pending_readers_count(), 1);

        token.cancel();
        assert_matches!(write_queued.await, Err(Error::AcquireCancelled));
        assert_eq!(lock.pending_writers_count(), 0);

        // The queued reader joins the holder without further releases.
        let joined = read_queued.await.unwrap();
        assert_eq!(lock.current_readers(), 2);
        drop(joined);
        drop(held);
    }

    /// Observers after a full round-trip match the idle state.
    #[tokio::test]
    async fn test_idle_round_trip() {
        let lock = RwLock::new();
        let grant = lock.write().await.unwrap();
        drop(grant);

        assert_eq!(lock.current_readers(), 0);
        assert!(!lock.has_writer());
        assert_eq!(lock.pending_readers_count(), 0);
        assert_eq!(lock.pending_writers_count(), 0);
    }

    /// The back-compat integer constructor keeps the default policy.
    #[test]
    fn test_constructors() {
        assert_eq!(RwLock::new().policy(), RwPolicy::WritePreferring);
        assert_eq!(
            RwLock::with_max_consecutive(5).policy(),
            RwPolicy::WritePreferring
        );
        assert_eq!(
            RwLock::with_policy(RwPolicy::ReadPreferring).policy(),
            RwPolicy::ReadPreferring
        );
    }
}
