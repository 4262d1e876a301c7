use thiserror::Error as ThisError;

/// Error kinds surfaced by the primitives.
///
/// Every failure a caller can observe settles into one of these variants;
/// nothing is retried or recovered silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The cancellation token fired before or while an acquisition was
    /// queued.
    #[error("acquisition cancelled")]
    AcquireCancelled,
    /// The cancellation token fired before or while a condition wait was
    /// queued.
    #[error("condition wait cancelled")]
    WaitCancelled,
    /// The cancellation token fired during a sleep.
    #[error("sleep cancelled")]
    SleepCancelled,
    /// The cancellation token fired on a pending generator operation.
    #[error("generator aborted")]
    GeneratorAborted,
    /// A semaphore was constructed with zero capacity.
    #[error("semaphore capacity must be at least 1")]
    InvalidCapacity,
}

/// Non-value outcome of a [`Deferred`](crate::Deferred) cell or a generator
/// item: either the producer rejected with its own error, or the associated
/// cancellation token fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Fault<E> {
    /// Rejected by the producer.
    #[error("{0}")]
    Error(E),
    /// Aborted by the cancellation token.
    #[error("aborted by cancellation token")]
    Aborted,
}

impl<E> Fault<E> {
    /// Returns true for [`Fault::Aborted`].
    pub fn is_aborted(&self) -> bool {
        matches!(self, Fault::Aborted)
    }
}
