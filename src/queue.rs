//! Fair wait queue and batch scheduler shared by every primitive.
//!
//! ## How acquisition works
//!
//! Calling `lock`/`acquire`/`read`/`write`/`wait` does its work up front:
//!
//! - **Immediate path**: the resource is free and nobody eligible is queued;
//!   the state mutates on the spot and the returned [`Acquire`] is already
//!   settled with a [`Grant`].
//! - **Slow path**: a [`Waiter`] is appended to the primitive's FIFO
//!   [`WaitList`] and, when a cancellation token was passed, a one-shot hook
//!   is registered that withdraws the entry if the token fires first.
//!
//! Because the queue position is taken at call time, program order is queue
//! order, and grants within one queue are strictly FIFO.
//!
//! ## Draining and fairness
//!
//! Releasing a resource re-runs the owner's *drain*: pop the head, grant it
//! if the resource permits, repeat. Every step, including popping an entry
//! that was cancelled in place, counts against a per-primitive [`Batch`]
//! budget. When the budget for one episode is spent, the drain wakes the
//! queue head and returns; the head's next poll (necessarily a fresh
//! scheduler turn) picks the drain back up via [`Slot::redrain`]. A tight
//! grant/release loop therefore cannot monopolize the dispatcher: at most
//! `max_consecutive` grants happen between two yields.
//!
//! ## Cancellation interleavings
//!
//! A request can be cancelled before enqueue (settled with an error on the
//! spot), while queued (the hook removes its entry and rejects it), or in a
//! race with the grant. The race is decided by a single compare-and-swap on
//! the waiter: the grant wins, the handle is delivered, and if the caller
//! already dropped the [`Acquire`], its drop impl returns the resource.

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    task::{Context, Poll, Waker},
};

use futures::task::AtomicWaker;

use crate::{error::Error, grant::Grant, token::CancellationToken};

/// Default bound on consecutive synchronous grants per drain episode.
pub const DEFAULT_MAX_CONSECUTIVE: usize = 20;

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELLED: u8 = 2;

/// One queued request.
///
/// The state moves from waiting to exactly one of granted or cancelled;
/// the compare-and-swap in [`transition`](Waiter::transition) is what makes
/// the grant/cancel race single-winner.
pub(crate) struct Waiter {
    state: AtomicU8,
    waker: AtomicWaker,
}

impl Waiter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WAITING),
            waker: AtomicWaker::new(),
        })
    }

    /// Resolves the waiter with a grant. Returns false if it lost the race
    /// against a cancellation.
    pub(crate) fn grant(&self) -> bool {
        self.transition(GRANTED)
    }

    /// Resolves the waiter with a cancellation. Returns false if it lost the
    /// race against a grant.
    pub(crate) fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    fn transition(&self, to: u8) -> bool {
        let won = self
            .state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.waker.wake();
        }
        won
    }

    pub(crate) fn is_granted(&self) -> bool {
        self.state.load(Ordering::Acquire) == GRANTED
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Wakes the waiter without resolving it; used to hand a deferred drain
    /// to the queue head.
    pub(crate) fn rouse(&self) {
        self.waker.wake();
    }

    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }
}

/// Strict-FIFO list of queued requests.
#[derive(Default)]
pub(crate) struct WaitList(VecDeque<Arc<Waiter>>);

impl WaitList {
    pub(crate) fn push_back(&mut self, waiter: Arc<Waiter>) {
        self.0.push_back(waiter);
    }

    /// Restores an entry to the front, giving it back its original turn.
    pub(crate) fn push_front(&mut self, waiter: Arc<Waiter>) {
        self.0.push_front(waiter);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Arc<Waiter>> {
        self.0.pop_front()
    }

    /// Pops the first entry that is still waiting, discarding cancelled
    /// leftovers on the way.
    pub(crate) fn pop_waiting(&mut self) -> Option<Arc<Waiter>> {
        while let Some(waiter) = self.0.pop_front() {
            if !waiter.is_cancelled() {
                return Some(waiter);
            }
        }
        None
    }

    /// Removes a specific entry by identity. O(len).
    pub(crate) fn remove(&mut self, waiter: &Arc<Waiter>) -> bool {
        match self.0.iter().position(|queued| Arc::ptr_eq(queued, waiter)) {
            Some(i) => {
                self.0.remove(i);
                true
            }
            None => false,
        }
    }

    /// Wakes the head entry so its next poll resumes a deferred drain.
    pub(crate) fn rouse_front(&self) {
        if let Some(head) = self.0.front() {
            head.rouse();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Consecutive-grant counter.
///
/// Counts every drain step (grant or cancelled-entry skip) and trips once the
/// configured limit is reached; the counter resets only when it trips, so a
/// grant burst spread over several releases still yields eventually.
pub(crate) struct Batch {
    limit: usize,
    consecutive: usize,
}

impl Batch {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            // A zero limit would never grant anything.
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    /// True when the budget for this episode is spent; also resets the
    /// counter for the next episode.
    pub(crate) fn exhausted(&mut self) -> bool {
        if self.consecutive >= self.limit {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }

    /// Accounts one grant or one cancelled-entry skip.
    pub(crate) fn count(&mut self) {
        self.consecutive += 1;
    }
}

/// The primitive-side callbacks an in-flight acquisition needs.
///
/// Implemented by each primitive's shared state (through a thin per-queue
/// adapter where one primitive owns several queues).
pub(crate) trait Slot: Send + Sync {
    /// Removes a cancelled or abandoned entry from its queue.
    fn detach(&self, waiter: &Arc<Waiter>);
    /// Resumes a drain that the batch counter deferred to this turn.
    fn redrain(&self);
    /// Builds the handle for a granted request.
    fn make_grant(&self) -> Grant;
    /// Returns the resource of a grant whose caller vanished before claiming
    /// it.
    fn forfeit(&self);
    /// The error reported when the request is cancelled.
    fn cancel_error(&self) -> Error;
}

/// Anything that can be acquired through the shared queue discipline.
///
/// All primitives in this crate implement it; the optional
/// [`prepare_acquire`](Acquirable::prepare_acquire) is the two-phase
/// reservation used by trigger-and-wait composition; see
/// [`Condition::trigger_and_wait`](crate::Condition::trigger_and_wait).
pub trait Acquirable {
    /// Starts an acquisition, taking the resource or a queue position
    /// synchronously. The returned future settles with the [`Grant`] or the
    /// cancellation error.
    fn begin_acquire(&self, token: Option<&CancellationToken>) -> Acquire;

    /// Reserves an acquisition without observably starting it, for atomic
    /// composition with a condition notify. Returns `None` when the target
    /// cannot reserve, forcing callers onto a non-atomic fallback.
    fn prepare_acquire(&self, token: Option<&CancellationToken>) -> Option<Acquire> {
        let _ = token;
        None
    }
}

enum AcquireState {
    /// Outcome decided at call time (immediate path or pre-cancelled token).
    Settled(Option<Result<Grant, Error>>),
    /// Waiting in a primitive's queue.
    Queued {
        waiter: Arc<Waiter>,
        slot: Arc<dyn Slot>,
        _registration: Option<crate::token::Registration>,
    },
    /// Outcome already handed out.
    Finished,
}

/// Future of a pending acquisition, shared by every primitive.
///
/// The queue position (or the resource itself) is taken when the acquisition
/// method is called, not on first poll.
///
/// # Cancel safety
///
/// Dropping a pending `Acquire` withdraws the request from its queue. If the
/// grant raced ahead of the drop, the resource is released on the caller's
/// behalf, so nothing leaks either way.
#[must_use = "futures do nothing unless polled"]
pub struct Acquire {
    state: AcquireState,
}

impl Acquire {
    pub(crate) fn settled(outcome: Result<Grant, Error>) -> Self {
        Self {
            state: AcquireState::Settled(Some(outcome)),
        }
    }

    /// Wraps a freshly queued waiter and attaches the cancellation hook.
    ///
    /// Must be called with the primitive's state lock released: an
    /// already-cancelled token runs the hook synchronously, and the hook
    /// takes that lock to detach the entry.
    pub(crate) fn queued(
        waiter: Arc<Waiter>,
        slot: Arc<dyn Slot>,
        token: Option<&CancellationToken>,
    ) -> Self {
        let registration = token.map(|token| {
            let hook_waiter = Arc::clone(&waiter);
            let hook_slot = Arc::clone(&slot);
            token.register(move || {
                if hook_waiter.cancel() {
                    hook_slot.detach(&hook_waiter);
                }
            })
        });
        Self {
            state: AcquireState::Queued {
                waiter,
                slot,
                _registration: registration,
            },
        }
    }
}

impl Future for Acquire {
    type Output = Result<Grant, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match &mut this.state {
            AcquireState::Settled(outcome) => outcome.take().expect("polled after completion"),
            AcquireState::Queued { waiter, slot, .. } => {
                if waiter.is_granted() {
                    Ok(slot.make_grant())
                } else if waiter.is_cancelled() {
                    Err(slot.cancel_error())
                } else {
                    waiter.register(cx.waker());
                    // Pick up a drain the batch counter handed to this turn.
                    slot.redrain();
                    // Re-check: the resolution may have raced the registration.
                    if waiter.is_granted() {
                        Ok(slot.make_grant())
                    } else if waiter.is_cancelled() {
                        Err(slot.cancel_error())
                    } else {
                        return Poll::Pending;
                    }
                }
            }
            AcquireState::Finished => panic!("polled after completion"),
        };
        this.state = AcquireState::Finished;
        Poll::Ready(outcome)
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if let AcquireState::Queued { waiter, slot, .. } = &self.state {
            if waiter.cancel() {
                // Still queued: withdraw the request.
                slot.detach(waiter);
            } else if waiter.is_granted() {
                // The grant won the race; return the unclaimed resource.
                slot.forfeit();
            }
        }
    }
}
