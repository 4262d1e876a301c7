//! Externally-settled cells.
//!
//! A [`Deferred`] is the promise/future pair folded into one object: anyone
//! holding a clone may settle it, every awaiter observes the single settled
//! outcome. The first of `resolve`, `reject`, or a cancellation-token abort
//! wins; later settlers are silent no-ops.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Fault},
    queue::Waiter,
    token::{CancellationToken, Registration},
};

struct DeferredState<T, E> {
    /// Stays `Some` forever after the first settle so that every awaiter can
    /// clone the outcome out.
    outcome: Option<Result<T, Fault<E>>>,
    waiters: Vec<Arc<Waiter>>,
    _registration: Option<Registration>,
}

struct DeferredInner<T, E> {
    state: Mutex<DeferredState<T, E>>,
}

impl<T, E> DeferredInner<T, E> {
    fn settle(&self, outcome: Result<T, Fault<E>>) {
        let waiters = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.grant();
        }
    }
}

/// A settle-once cell.
///
/// # Cloning
///
/// Clones share the cell; the first settler across all clones wins.
pub struct Deferred<T, E = Error> {
    inner: Arc<DeferredInner<T, E>>,
}

impl<T, E> Deferred<T, E> {
    /// A fresh, unsettled cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeferredInner {
                state: Mutex::new(DeferredState {
                    outcome: None,
                    waiters: Vec::new(),
                    _registration: None,
                }),
            }),
        }
    }

    /// Settles the cell with a value.
    pub fn resolve(&self, value: T) {
        self.inner.settle(Ok(value));
    }

    /// Settles the cell with an error.
    pub fn reject(&self, error: E) {
        self.inner.settle(Err(Fault::Error(error)));
    }

    /// Whether the cell has been settled (by any path).
    pub fn is_settled(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// A future yielding the settled outcome. May be awaited by any number
    /// of tasks; each receives a clone of the one outcome.
    pub fn wait(&self) -> Wait<T, E> {
        Wait {
            inner: Arc::clone(&self.inner),
            waiter: None,
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// A cell that settles with [`Fault::Aborted`] if the token fires before
    /// anyone resolved or rejected it.
    pub fn with_token(token: &CancellationToken) -> Self {
        let cell = Self::new();
        let weak = Arc::downgrade(&cell.inner);
        let registration = token.register(move || {
            if let Some(inner) = weak.upgrade() {
                inner.settle(Err(Fault::Aborted));
            }
        });
        cell.inner.state.lock()._registration = Some(registration);
        cell
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Future returned by [`Deferred::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct Wait<T, E = Error> {
    inner: Arc<DeferredInner<T, E>>,
    waiter: Option<Arc<Waiter>>,
}

impl<T, E> Future for Wait<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Result<T, Fault<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.waiter {
            None => {
                let mut state = this.inner.state.lock();
                if let Some(outcome) = &state.outcome {
                    return Poll::Ready(outcome.clone());
                }
                let waiter = Waiter::new();
                waiter.register(cx.waker());
                state.waiters.push(Arc::clone(&waiter));
                drop(state);
                this.waiter = Some(waiter);
                Poll::Pending
            }
            Some(waiter) => {
                if !waiter.is_granted() {
                    waiter.register(cx.waker());
                    // The settle may have raced the registration.
                    if !waiter.is_granted() {
                        return Poll::Pending;
                    }
                }
                let state = this.inner.state.lock();
                let outcome = state.outcome.as_ref().expect("granted without outcome");
                Poll::Ready(outcome.clone())
            }
        }
    }
}

impl<T, E> Drop for Wait<T, E> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let mut state = self.inner.state.lock();
            state.waiters.retain(|queued| !Arc::ptr_eq(queued, &waiter));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::task::Context;

    use assert_matches::assert_matches;

    use super::*;

    /// The first settler wins; later settlers are silent no-ops.
    #[test]
    fn test_first_writer_wins() {
        let cell: Deferred<i32, Error> = Deferred::new();
        assert!(!cell.is_settled());

        cell.resolve(1);
        cell.resolve(2);
        cell.reject(Error::AcquireCancelled);
        assert!(cell.is_settled());

        let mut wait = Box::pin(cell.wait());
        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        assert_matches!(wait.as_mut().poll(&mut context), Poll::Ready(Ok(1)));
    }

    /// An awaiter parked before the settle is woken and observes it.
    #[test]
    fn test_pending_then_resolved() {
        let cell: Deferred<&str, Error> = Deferred::new();
        let mut wait = Box::pin(cell.wait());

        let (waker, wake_count) = futures_test::task::new_count_waker();
        let mut context = Context::from_waker(&waker);

        assert_matches!(wait.as_mut().poll(&mut context), Poll::Pending);
        cell.resolve("done");
        assert_eq!(wake_count.get(), 1);
        assert_matches!(wait.as_mut().poll(&mut context), Poll::Ready(Ok("done")));
    }

    /// Every awaiter receives the one outcome.
    #[tokio::test]
    async fn test_many_awaiters() {
        let cell: Deferred<i32, Error> = Deferred::new();
        let first = cell.wait();
        let second = cell.wait();

        cell.resolve(7);

        assert_eq!(first.await, Ok(7));
        assert_eq!(second.await, Ok(7));
    }

    /// Rejection surfaces as a producer fault.
    #[tokio::test]
    async fn test_reject() {
        let cell: Deferred<i32, &str> = Deferred::new();
        cell.reject("boom");
        assert_eq!(cell.wait().await, Err(Fault::Error("boom")));
    }

    /// Token cancellation aborts a pending cell and disarms later settlers.
    #[tokio::test]
    async fn test_token_aborts() {
        let token = CancellationToken::new();
        let cell: Deferred<i32, Error> = Deferred::with_token(&token);

        token.cancel();
        cell.resolve(3);

        assert_eq!(cell.wait().await, Err(Fault::Aborted));
    }

    /// A settle that lands first disarms the token hook.
    #[tokio::test]
    async fn test_settle_beats_token() {
        let token = CancellationToken::new();
        let cell: Deferred<i32, Error> = Deferred::with_token(&token);

        cell.resolve(9);
        token.cancel();

        assert_eq!(cell.wait().await, Ok(9));
    }

    /// A dropped awaiter leaves no waiter entry behind.
    #[test]
    fn test_dropped_wait_detaches() {
        let cell: Deferred<i32, Error> = Deferred::new();
        let mut wait = Box::pin(cell.wait());

        let noop_waker = futures_test::task::noop_waker();
        let mut context = Context::from_waker(&noop_waker);
        assert_matches!(wait.as_mut().poll(&mut context), Poll::Pending);
        assert_eq!(cell.inner.state.lock().waiters.len(), 1);

        drop(wait);
        assert_eq!(cell.inner.state.lock().waiters.len(), 0);
    }
}
