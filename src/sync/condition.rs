use std::sync::Arc;

use crate::{
    error::Error,
    grant::Grant,
    queue::{Acquirable, Acquire, Slot, WaitList, Waiter},
    token::CancellationToken,
};

/// Internal view a trigger-and-wait composition needs of a condition:
/// pull one waiter aside, put it back unresolved, or commit the notify.
trait NotifySource {
    fn take_waiter(&self) -> Option<Arc<Waiter>>;
    fn restore_waiter(&self, waiter: Arc<Waiter>);
    /// Resolves the chosen waiter (falling back to later entries if it was
    /// cancelled in the meantime) and applies the notify side effects.
    fn commit(&self, waiter: Option<Arc<Waiter>>);
}

fn resolve_first(source: &dyn NotifySource, waiter: Option<Arc<Waiter>>) {
    let mut next = waiter;
    while let Some(waiter) = next {
        if waiter.grant() {
            return;
        }
        next = source.take_waiter();
    }
}

/// Two-phase "notify one, acquire elsewhere" composition shared by both
/// condition flavors.
///
/// The target reservation is taken *before* the condition waiter resolves
/// and no suspension point separates the two, so no task can observe the
/// notify without the reservation. If the target cannot reserve, the
/// composition degrades to a plain notify followed by a plain acquisition.
async fn trigger_and_wait_on<A>(
    source: &dyn NotifySource,
    target: &A,
    token: Option<&CancellationToken>,
) -> Result<Grant, Error>
where
    A: Acquirable + ?Sized,
{
    let waiter = source.take_waiter();
    let Some(reserved) = target.prepare_acquire(token) else {
        tracing::warn!(
            "trigger-and-wait target lacks two-phase acquisition; notify and acquire run non-atomically"
        );
        source.commit(waiter);
        return target.begin_acquire(token).await;
    };
    if token.is_some_and(CancellationToken::is_cancelled) {
        // Abort before commit: the dropped reservation detaches itself and
        // the un-notified waiter gets its turn back.
        drop(reserved);
        if let Some(waiter) = waiter {
            source.restore_waiter(waiter);
        }
        return Err(Error::AcquireCancelled);
    }
    source.commit(waiter);
    reserved.await
}

// ---------------------------------------------------------------------------
// Edge-triggered condition
// ---------------------------------------------------------------------------

struct ConditionInner {
    queue: parking_lot::Mutex<WaitList>,
}

struct ConditionSlot(Arc<ConditionInner>);

impl Slot for ConditionSlot {
    fn detach(&self, waiter: &Arc<Waiter>) {
        self.0.queue.lock().remove(waiter);
    }

    fn redrain(&self) {}

    fn make_grant(&self) -> Grant {
        Grant::inert()
    }

    fn forfeit(&self) {}

    fn cancel_error(&self) -> Error {
        Error::WaitCancelled
    }
}

impl NotifySource for ConditionInner {
    fn take_waiter(&self) -> Option<Arc<Waiter>> {
        self.queue.lock().pop_waiting()
    }

    fn restore_waiter(&self, waiter: Arc<Waiter>) {
        self.queue.lock().push_front(waiter);
    }

    fn commit(&self, waiter: Option<Arc<Waiter>>) {
        resolve_first(self, waiter);
    }
}

/// Edge-triggered condition: a notify with nobody waiting is lost.
///
/// [`wait`](Condition::wait) suspends until some task calls
/// [`notify_one`](Condition::notify_one); the resolved waiter receives an
/// inert [`Grant`]. Waiters resolve strictly in arrival order.
///
/// # Cloning
///
/// Clones share the wait queue.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

impl Condition {
    /// A fresh condition with no waiters.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConditionInner {
                queue: parking_lot::Mutex::new(WaitList::default()),
            }),
        }
    }

    /// Waits for the next notification.
    pub fn wait(&self) -> Acquire {
        self.begin_acquire(None)
    }

    /// Like [`wait`](Self::wait), rejecting with [`Error::WaitCancelled`] if
    /// the token fires first.
    pub fn wait_with(&self, token: &CancellationToken) -> Acquire {
        self.begin_acquire(Some(token))
    }

    /// Resolves the longest-waiting task, if any; otherwise does nothing.
    pub fn notify_one(&self) {
        let waiter = self.inner.queue.lock().pop_waiting();
        resolve_first(&*self.inner, waiter);
    }

    /// Number of tasks currently waiting.
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Atomically composes "notify one waiter" with an acquisition on
    /// `target`: the target grant (or queue position) is reserved first, the
    /// waiter resolves second, with no suspension point in between.
    pub async fn trigger_and_wait<A>(&self, target: &A) -> Result<Grant, Error>
    where
        A: Acquirable + ?Sized,
    {
        trigger_and_wait_on(&*self.inner, target, None).await
    }

    /// Like [`trigger_and_wait`](Self::trigger_and_wait) with a cancellation
    /// token. A token that fires before the commit leaves the condition
    /// untouched; one that fires later cancels only the acquisition.
    pub async fn trigger_and_wait_with<A>(
        &self,
        target: &A,
        token: &CancellationToken,
    ) -> Result<Grant, Error>
    where
        A: Acquirable + ?Sized,
    {
        trigger_and_wait_on(&*self.inner, target, Some(token)).await
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Acquirable for Condition {
    fn begin_acquire(&self, token: Option<&CancellationToken>) -> Acquire {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Acquire::settled(Err(Error::WaitCancelled));
        }
        let waiter = Waiter::new();
        self.inner.queue.lock().push_back(Arc::clone(&waiter));
        let slot: Arc<dyn Slot> = Arc::new(ConditionSlot(Arc::clone(&self.inner)));
        Acquire::queued(waiter, slot, token)
    }

    fn prepare_acquire(&self, token: Option<&CancellationToken>) -> Option<Acquire> {
        Some(self.begin_acquire(token))
    }
}

// ---------------------------------------------------------------------------
// Level-held condition
// ---------------------------------------------------------------------------

struct ManualState {
    raised: bool,
    queue: WaitList,
}

struct ManualInner {
    state: parking_lot::Mutex<ManualState>,
}

struct ManualSlot(Arc<ManualInner>);

impl Slot for ManualSlot {
    fn detach(&self, waiter: &Arc<Waiter>) {
        self.0.state.lock().queue.remove(waiter);
    }

    fn redrain(&self) {}

    fn make_grant(&self) -> Grant {
        Grant::inert()
    }

    fn forfeit(&self) {}

    fn cancel_error(&self) -> Error {
        Error::WaitCancelled
    }
}

impl NotifySource for ManualInner {
    fn take_waiter(&self) -> Option<Arc<Waiter>> {
        self.state.lock().queue.pop_waiting()
    }

    fn restore_waiter(&self, waiter: Arc<Waiter>) {
        self.state.lock().queue.push_front(waiter);
    }

    fn commit(&self, waiter: Option<Arc<Waiter>>) {
        self.state.lock().raised = false;
        resolve_first(self, waiter);
    }
}

/// Level-held condition: a raise that finds nobody waiting is remembered.
///
/// While the condition is raised, new waiters resolve immediately with an
/// inert [`Grant`]. [`raise`](ManualCondition::raise) resolves every current
/// waiter and latches; [`reset`](ManualCondition::reset) clears the latch;
/// [`notify_one`](ManualCondition::notify_one) clears the latch and resolves
/// at most one waiter.
///
/// # Cloning
///
/// Clones share the latch and the wait queue.
#[derive(Clone)]
pub struct ManualCondition {
    inner: Arc<ManualInner>,
}

impl ManualCondition {
    /// A fresh condition in the dropped (unraised) state.
    pub fn new() -> Self {
        Self::with_initial(false)
    }

    /// A fresh condition with an explicit initial latch state.
    pub fn with_initial(raised: bool) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                state: parking_lot::Mutex::new(ManualState {
                    raised,
                    queue: WaitList::default(),
                }),
            }),
        }
    }

    /// Waits until the condition is raised; resolves immediately while the
    /// latch is set.
    pub fn wait(&self) -> Acquire {
        self.begin_acquire(None)
    }

    /// Like [`wait`](Self::wait), rejecting with [`Error::WaitCancelled`] if
    /// the token fires first.
    pub fn wait_with(&self, token: &CancellationToken) -> Acquire {
        self.begin_acquire(Some(token))
    }

    /// Sets the latch and resolves every task currently waiting.
    pub fn raise(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.raised = true;
            let mut drained = Vec::with_capacity(state.queue.len());
            while let Some(waiter) = state.queue.pop_front() {
                drained.push(waiter);
            }
            drained
        };
        for waiter in waiters {
            waiter.grant();
        }
    }

    /// Clears the latch; tasks arriving afterwards wait again.
    pub fn reset(&self) {
        self.inner.state.lock().raised = false;
    }

    /// Clears the latch and resolves the longest-waiting task, if any.
    pub fn notify_one(&self) {
        let waiter = {
            let mut state = self.inner.state.lock();
            state.raised = false;
            state.queue.pop_waiting()
        };
        resolve_first(&*self.inner, waiter);
    }

    /// Whether the latch is currently set.
    pub fn is_raised(&self) -> bool {
        self.inner.state.lock().raised
    }

    /// Number of tasks currently waiting.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Atomically composes "notify one waiter" (clearing the latch) with an
    /// acquisition on `target`; see [`Condition::trigger_and_wait`].
    pub async fn trigger_and_wait<A>(&self, target: &A) -> Result<Grant, Error>
    where
        A: Acquirable + ?Sized,
    {
        trigger_and_wait_on(&*self.inner, target, None).await
    }

    /// Like [`trigger_and_wait`](Self::trigger_and_wait) with a cancellation
    /// token.
    pub async fn trigger_and_wait_with<A>(
        &self,
        target: &A,
        token: &CancellationToken,
    ) -> Result<Grant, Error>
    where
        A: Acquirable + ?Sized,
    {
        trigger_and_wait_on(&*self.inner, target, Some(token)).await
    }
}

impl Default for ManualCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl Acquirable for ManualCondition {
    fn begin_acquire(&self, token: Option<&CancellationToken>) -> Acquire {
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Acquire::settled(Err(Error::WaitCancelled));
        }
        let mut state = self.inner.state.lock();
        if state.raised {
            return Acquire::settled(Ok(Grant::inert()));
        }
        let waiter = Waiter::new();
        state.queue.push_back(Arc::clone(&waiter));
        drop(state);
        let slot: Arc<dyn Slot> = Arc::new(ManualSlot(Arc::clone(&self.inner)));
        Acquire::queued(waiter, slot, token)
    }

    fn prepare_acquire(&self, token: Option<&CancellationToken>) -> Option<Acquire> {
        Some(self.begin_acquire(token))
    }
}

#[cfg(test)]
mod tests {
    use std::task::{Context, Poll};

    use assert_matches::assert_matches;

    use super::*;

    /// A notification resolves exactly the longest-waiting task.
    #[tokio::test]
    async fn test_notify_fifo() {
        let condition = Condition::new();

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        let mut first = Box::pin(condition.wait());
        let mut second = Box::pin(condition.wait());
        assert_matches!(first.as_mut().poll(&mut context), Poll::Pending);
        assert_matches!(second.as_mut().poll(&mut context), Poll::Pending);
        assert_eq!(condition.pending_count(), 2);

        condition.notify_one();
        assert_matches!(first.as_mut().poll(&mut context), Poll::Ready(Ok(_)));
        assert_matches!(second.as_mut().poll(&mut context), Poll::Pending);

        condition.notify_one();
        assert_matches!(second.as_mut().poll(&mut context), Poll::Ready(Ok(_)));
    }

    /// A notify with nobody waiting is lost.
    #[tokio::test]
    async fn test_notify_lost_without_waiter() {
        let condition = Condition::new();
        condition.notify_one();

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        let mut wait = Box::pin(condition.wait());
        assert_matches!(wait.as_mut().poll(&mut context), Poll::Pending);
    }

    /// Cancelling a wait removes it; the notification goes to the next task.
    #[tokio::test]
    async fn test_cancelled_wait_skipped() {
        let condition = Condition::new();
        let token = CancellationToken::new();

        let cancelled = condition.wait_with(&token);
        let kept = condition.wait();

        token.cancel();
        assert_matches!(cancelled.await, Err(Error::WaitCancelled));
        assert_eq!(condition.pending_count(), 1);

        condition.notify_one();
        kept.await.unwrap();
    }

    /// An initially-raised manual condition resolves waits synchronously;
    /// after a reset it suspends again until raised.
    #[tokio::test]
    async fn test_manual_initially_raised() {
        let condition = ManualCondition::with_initial(true);
        let grant = condition.wait().await.unwrap();
        assert!(grant.is_active());

        condition.reset();
        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        let mut wait = Box::pin(condition.wait());
        assert_matches!(wait.as_mut().poll(&mut context), Poll::Pending);

        condition.raise();
        assert_matches!(wait.as_mut().poll(&mut context), Poll::Ready(Ok(_)));
    }

    /// Raise resolves every waiter at once and latches for latecomers.
    #[tokio::test]
    async fn test_manual_raise_resolves_all() {
        let condition = ManualCondition::new();

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        let mut first = Box::pin(condition.wait());
        let mut second = Box::pin(condition.wait());
        assert_matches!(first.as_mut().poll(&mut context), Poll::Pending);
        assert_matches!(second.as_mut().poll(&mut context), Poll::Pending);

        condition.raise();
        assert_matches!(first.as_mut().poll(&mut context), Poll::Ready(Ok(_)));
        assert_matches!(second.as_mut().poll(&mut context), Poll::Ready(Ok(_)));

        // Still raised: latecomers pass straight through.
        condition.wait().await.unwrap();
    }

    /// notify_one on a raised manual condition clears the latch and wakes at
    /// most one task.
    #[tokio::test]
    async fn test_manual_notify_clears_latch() {
        let condition = ManualCondition::with_initial(true);
        condition.notify_one();
        assert!(!condition.is_raised());

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        let mut first = Box::pin(condition.wait());
        let mut second = Box::pin(condition.wait());
        assert_matches!(first.as_mut().poll(&mut context), Poll::Pending);
        assert_matches!(second.as_mut().poll(&mut context), Poll::Pending);

        condition.notify_one();
        assert_matches!(first.as_mut().poll(&mut context), Poll::Ready(Ok(_)));
        assert_matches!(second.as_mut().poll(&mut context), Poll::Pending);
    }

    /// Raise-then-reset on an idle condition is indistinguishable from the
    /// initial dropped state.
    #[test]
    fn test_manual_raise_reset_round_trip() {
        let condition = ManualCondition::new();
        condition.raise();
        condition.reset();
        assert!(!condition.is_raised());
        assert_eq!(condition.pending_count(), 0);
    }
}
