//! Cooperatively-scheduled async synchronization primitives
//!
//! A coherent family of coordination objects ([`Mutex`], [`Semaphore`],
//! [`RwLock`], [`Condition`]/[`ManualCondition`], [`Deferred`], and a
//! producer-driven [`generator`]) bound together by one queueing,
//! cancellation, and fairness discipline.
//!
//! ## The shared discipline
//!
//! - **Acquire asynchronously, release through a handle.** Every acquisition
//!   returns an [`Acquire`] future resolving to a [`Grant`]; releasing the
//!   grant (explicitly or on drop) returns the resource.
//! - **Strict FIFO queues.** Requests take their queue position at call
//!   time, so program order is grant order within a queue. The [`RwLock`]
//!   arbitrates between its two queues by a selectable
//!   [`RwPolicy`].
//! - **Bounded drain batches.** A release grants queued requests
//!   synchronously only up to `max_consecutive` (default
//!   [`DEFAULT_MAX_CONSECUTIVE`]) per episode, then hands the rest to the
//!   next scheduler turn, so a tight acquire/release loop cannot starve the
//!   dispatcher.
//! - **Cooperative cancellation.** Any wait accepts a
//!   [`CancellationToken`]. A token that fires before enqueue rejects on the
//!   spot; one that fires while queued removes the entry and rejects; one
//!   that races the grant loses: the handle is delivered, and if the caller
//!   is already gone the resource is auto-released.
//!
//! ## Concurrency model
//!
//! The primitives assume cooperative scheduling and interpose a small
//! internal mutex around each primitive's state, which makes them safe on
//! multi-threaded executors while keeping single-dispatcher semantics. They
//! are executor-agnostic: only the optional `time` feature (the [`sleep`]
//! helpers) needs a timer driver.
//!
//! ## Example
//!
//! ```
//! use insieme::{CancellationToken, Semaphore};
//!
//! # async fn example() {
//! let pool = Semaphore::new(2).unwrap();
//! let token = CancellationToken::new();
//!
//! let grant = pool.acquire_with(&token).await.unwrap();
//! assert_eq!(pool.available_count(), 1);
//! drop(grant);
//! # }
//! ```

pub mod deferred;
pub mod error;
pub mod generator;
mod grant;
mod queue;
pub mod sync;
pub mod time;
pub mod token;

pub use deferred::{Deferred, Wait};
pub use error::{Error, Fault};
pub use generator::{Consumer, GeneratorOptions, Producer, generator, generator_with};
pub use grant::Grant;
pub use queue::{Acquirable, Acquire, DEFAULT_MAX_CONSECUTIVE};
pub use sync::{
    Condition, ManualCondition, Mutex, RwLock, RwLockOptions, RwPolicy, RwReader, RwWriter,
    Semaphore,
};
#[cfg(feature = "time")]
pub use time::{sleep, sleep_with};
pub use time::{YieldNow, defer, yield_now};
pub use token::{CancellationToken, Cancelled, Registration};
