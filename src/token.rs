//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a shared flag whose transition to `cancelled`
//! is irreversible. Interested parties either poll
//! [`is_cancelled`](CancellationToken::is_cancelled), register a one-shot
//! hook via [`register`](CancellationToken::register), or await
//! [`cancelled`](CancellationToken::cancelled).
//!
//! Hooks fire exactly once: either the cancellation runs the callback or the
//! [`Registration`] is released first, never both. Hook panics are caught and
//! logged; they must not propagate into whichever task happened to call
//! [`cancel`](CancellationToken::cancel).

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use futures::{future::FusedFuture, task::AtomicWaker};
use parking_lot::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

struct TokenState {
    /// Irreversible cancellation flag. Written only under the hook-list lock
    /// so that registration and firing serialize.
    cancelled: AtomicBool,
    hooks: Mutex<HookList>,
}

#[derive(Default)]
struct HookList {
    next_id: u64,
    entries: Vec<(u64, Hook)>,
}

impl TokenState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

fn run_hook(hook: Hook) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        tracing::warn!("cancellation hook panicked; panic swallowed");
    }
}

/// A shared cancellation flag with one-shot hook registration.
///
/// # Cloning
///
/// Clones share the underlying flag: cancelling any clone cancels all of
/// them.
#[derive(Clone)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(HookList::default()),
            }),
        }
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Cancels the token and fires every registered hook exactly once.
    /// Cancelling again does nothing.
    pub fn cancel(&self) {
        let fired = {
            let mut hooks = self.state.hooks.lock();
            if self.state.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut hooks.entries)
        };
        // Hooks run outside the lock: a hook may re-enter the token.
        for (_, hook) in fired {
            run_hook(hook);
        }
    }

    /// Registers a one-shot hook.
    ///
    /// If the token is already cancelled the hook runs synchronously before
    /// this returns and the returned registration is inert. Otherwise the
    /// hook fires on [`cancel`](Self::cancel) unless the registration is
    /// released first; exactly one of the two wins.
    pub fn register<F>(&self, hook: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = self.state.hooks.lock();
            if !self.state.is_cancelled() {
                let id = hooks.next_id;
                hooks.next_id += 1;
                hooks.entries.push((id, Box::new(hook)));
                return Registration {
                    slot: Some((Arc::downgrade(&self.state), id)),
                };
            }
        }
        run_hook(Box::new(hook));
        Registration { slot: None }
    }

    /// A future resolving once the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            signal: Arc::new(AtomicWaker::new()),
            registration: None,
            terminated: false,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Undoes a hook registration.
///
/// Releasing is idempotent, runs on drop, and is a no-op once the hook has
/// fired (or when the token itself is gone).
pub struct Registration {
    slot: Option<(Weak<TokenState>, u64)>,
}

impl Registration {
    /// Removes the hook so it will never fire.
    pub fn release(&mut self) {
        let Some((state, id)) = self.slot.take() else {
            return;
        };
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut hooks = state.hooks.lock();
        // Firing order is unspecified, so removal can swap.
        if let Some(i) = hooks.entries.iter().position(|(entry, _)| *entry == id) {
            hooks.entries.swap_remove(i);
        }
    }

    /// Whether the registration has already been released (or was inert).
    pub fn is_released(&self) -> bool {
        self.slot.is_none()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

/// Future returned by [`CancellationToken::cancelled`].
///
/// Registers a wake-up hook lazily on first poll and removes it again when
/// dropped before the token fires.
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    token: CancellationToken,
    signal: Arc<AtomicWaker>,
    registration: Option<Registration>,
    terminated: bool,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            this.terminated = true;
            return Poll::Ready(());
        }
        this.signal.register(cx.waker());
        if this.registration.is_none() {
            let signal = Arc::clone(&this.signal);
            this.registration = Some(this.token.register(move || signal.wake()));
        }
        // The hook may have fired between the first check and registration.
        if this.token.is_cancelled() {
            this.terminated = true;
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl FusedFuture for Cancelled {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
