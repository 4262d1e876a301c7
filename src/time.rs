//! Scheduling helpers: cooperative yielding and cancellable sleeps.
//!
//! The primitives themselves never touch a clock; callers build timeouts by
//! combining a cancellation token with [`sleep_with`]. The sleep helpers sit
//! behind the `time` feature (on by default) because they are the one place
//! this crate needs a timer driver.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

#[cfg(feature = "time")]
use std::time::Duration;

#[cfg(feature = "time")]
use futures::future::{Either, select};

#[cfg(feature = "time")]
use crate::{error::Error, token::CancellationToken};

/// Yields to the scheduler once.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            // Self-wake so the task is rescheduled on the next turn.
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Runs `f` on the next scheduler turn and returns its result.
pub async fn defer<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    yield_now().await;
    f()
}

/// Suspends for the given duration.
#[cfg(feature = "time")]
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Suspends for the given duration, rejecting with
/// [`Error::SleepCancelled`] if the token fires first.
#[cfg(feature = "time")]
pub async fn sleep_with(duration: Duration, token: &CancellationToken) -> Result<(), Error> {
    if token.is_cancelled() {
        return Err(Error::SleepCancelled);
    }
    let timer = std::pin::pin!(tokio::time::sleep(duration));
    let cancelled = std::pin::pin!(token.cancelled());
    match select(timer, cancelled).await {
        Either::Left(((), _)) => Ok(()),
        Either::Right(((), _)) => Err(Error::SleepCancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// yield_now suspends exactly once.
    #[tokio::test]
    async fn test_yield_once() {
        yield_now().await;
    }

    /// defer runs its closure after the yield and passes the result through.
    #[tokio::test]
    async fn test_defer() {
        let out = defer(|| 41 + 1).await;
        assert_eq!(out, 42);
    }

    /// An undisturbed sleep completes.
    #[cfg(feature = "time")]
    #[tokio::test]
    async fn test_sleep_completes() {
        let token = crate::CancellationToken::new();
        sleep_with(Duration::from_millis(1), &token).await.unwrap();
    }

    /// A cancelled token cuts the sleep short.
    #[cfg(feature = "time")]
    #[tokio::test]
    async fn test_sleep_cancelled() {
        use assert_matches::assert_matches;

        let token = crate::CancellationToken::new();
        let sleeper = sleep_with(Duration::from_secs(60), &token);
        let canceller = async {
            yield_now().await;
            token.cancel();
        };
        let (outcome, ()) = futures::join!(sleeper, canceller);
        assert_matches!(outcome, Err(Error::SleepCancelled));
    }

    /// An already-cancelled token rejects without sleeping at all.
    #[cfg(feature = "time")]
    #[tokio::test]
    async fn test_sleep_pre_cancelled() {
        use assert_matches::assert_matches;

        let token = crate::CancellationToken::new();
        token.cancel();
        let outcome = sleep_with(Duration::from_secs(60), &token).await;
        assert_matches!(outcome, Err(Error::SleepCancelled));
    }
}
