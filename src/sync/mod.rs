//! The primitive family: mutex, semaphore, reader/writer lock, conditions.
//!
//! Every primitive follows the same discipline:
//!
//! | concern | behavior |
//! |---------|----------|
//! | Acquisition | work happens at call time: immediate grant or FIFO enqueue |
//! | Handles | a [`Grant`](crate::Grant) per grant; release once, auto on drop |
//! | Fairness | drains grant in queue order, bounded per turn by `max_consecutive` |
//! | Cancellation | a token rejects before enqueue, dequeues while waiting, loses against a grant |
//!
//! The conditions additionally offer
//! [`trigger_and_wait`](Condition::trigger_and_wait), which composes "notify
//! one waiter" with an acquisition on any [`Acquirable`](crate::Acquirable)
//! target without a window in which the notify is observable but the
//! acquisition is not reserved.

mod condition;
mod mutex;
mod rwlock;
mod semaphore;

pub use condition::{Condition, ManualCondition};
pub use mutex::Mutex;
pub use rwlock::{RwLock, RwLockOptions, RwPolicy, RwReader, RwWriter};
pub use semaphore::Semaphore;
