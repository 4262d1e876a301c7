//! Producer-driven async sequences.
//!
//! A deferred generator is a queue with a producer half pushing values,
//! completion, or failure, and a consumer half draining them as a
//! [`Stream`]. With `max_items` set, the queue is bounded and producer
//! operations wait for space. A shared cancellation token aborts both
//! halves.
//!
//! Internally the halves coordinate through two level-held conditions:
//! `arrived` is raised on every enqueue and reset when the consumer drains
//! the queue empty; `can_reserve` (bounded mode only) is raised while space
//! exists.
//!
//! ## Example
//!
//! ```
//! use futures::StreamExt;
//! use insieme::{Error, generator};
//!
//! # async fn example() {
//! let (producer, mut consumer) = generator::<i32, Error>();
//! producer.emit(1).await.unwrap();
//! producer.complete().await.unwrap();
//!
//! assert_eq!(consumer.next().await, Some(Ok(1)));
//! assert_eq!(consumer.next().await, None);
//! # }
//! ```

use std::{
    cell::Cell,
    collections::VecDeque,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;

use crate::{
    error::{Error, Fault},
    sync::ManualCondition,
    token::CancellationToken,
};

/// Constructor options for [`generator_with`].
#[derive(Default, Clone)]
pub struct GeneratorOptions {
    /// Queue bound; producer operations wait for space when reached. Values
    /// below 1 are clamped to 1. `None` means unbounded.
    pub max_items: Option<usize>,
    /// Shared token aborting both halves when it fires.
    pub token: Option<CancellationToken>,
}

enum Item<T, E> {
    Value(T),
    Completed,
    Error(E),
}

struct GeneratorState<T, E> {
    queue: VecDeque<Item<T, E>>,
    /// A terminator has been enqueued; later pushes are accepted silently.
    closed: bool,
    /// The consumer consumed a terminator (or reported the abort).
    finished: bool,
    aborted: bool,
    consumer_gone: bool,
    _registration: Option<crate::token::Registration>,
}

struct GeneratorShared<T, E> {
    state: parking_lot::Mutex<GeneratorState<T, E>>,
    arrived: ManualCondition,
    can_reserve: Option<ManualCondition>,
    max_items: Option<usize>,
}

impl<T, E> GeneratorShared<T, E> {
    fn abort(&self) {
        {
            self.state.lock().aborted = true;
        }
        // Latch both conditions so every parked half wakes and re-checks.
        self.arrived.raise();
        if let Some(space) = &self.can_reserve {
            space.raise();
        }
    }
}

/// An unbounded, token-less generator. See [`generator_with`].
pub fn generator<T, E>() -> (Producer<T, E>, Consumer<T, E>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    generator_with(GeneratorOptions::default())
}

/// A producer/consumer pair over one deferred sequence.
pub fn generator_with<T, E>(options: GeneratorOptions) -> (Producer<T, E>, Consumer<T, E>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    let max_items = options.max_items.map(|max| max.max(1));
    let shared = Arc::new(GeneratorShared {
        state: parking_lot::Mutex::new(GeneratorState {
            queue: VecDeque::new(),
            closed: false,
            finished: false,
            aborted: false,
            consumer_gone: false,
            _registration: None,
        }),
        arrived: ManualCondition::new(),
        can_reserve: max_items.map(|_| ManualCondition::with_initial(true)),
        max_items,
    });
    if let Some(token) = &options.token {
        let weak = Arc::downgrade(&shared);
        let registration = token.register(move || {
            if let Some(shared) = weak.upgrade() {
                shared.abort();
            }
        });
        shared.state.lock()._registration = Some(registration);
    }
    let producer = Producer {
        shared: Arc::clone(&shared),
        _not_clone: PhantomData,
    };
    let consumer = Consumer {
        shared,
        pending: None,
        _not_clone: PhantomData,
    };
    (producer, consumer)
}

/// Producer half of a generator.
///
/// Dropping it without an explicit [`complete`](Producer::complete) ends the
/// sequence as if completed.
pub struct Producer<T, E = Error> {
    shared: Arc<GeneratorShared<T, E>>,
    _not_clone: PhantomData<Cell<()>>, //marker type to avoid cloning implementations
}

impl<T, E> Producer<T, E> {
    /// Enqueues one value, waiting for buffer space in bounded mode.
    pub async fn emit(&self, value: T) -> Result<(), Error> {
        self.push(Item::Value(value), None).await
    }

    /// Like [`emit`](Self::emit), aborting with [`Error::GeneratorAborted`]
    /// if the token fires while waiting for space.
    pub async fn emit_with(&self, value: T, token: &CancellationToken) -> Result<(), Error> {
        self.push(Item::Value(value), Some(token)).await
    }

    /// Ends the sequence after everything already enqueued.
    pub async fn complete(&self) -> Result<(), Error> {
        self.push(Item::Completed, None).await
    }

    /// Like [`complete`](Self::complete) with a cancellation token.
    pub async fn complete_with(&self, token: &CancellationToken) -> Result<(), Error> {
        self.push(Item::Completed, Some(token)).await
    }

    /// Ends the sequence with an error after everything already enqueued.
    pub async fn fail(&self, error: E) -> Result<(), Error> {
        self.push(Item::Error(error), None).await
    }

    /// Like [`fail`](Self::fail) with a cancellation token.
    pub async fn fail_with(&self, error: E, token: &CancellationToken) -> Result<(), Error> {
        self.push(Item::Error(error), Some(token)).await
    }

    /// Items currently buffered and not yet consumed.
    pub fn buffered_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    async fn push(&self, item: Item<T, E>, token: Option<&CancellationToken>) -> Result<(), Error> {
        loop {
            let space = {
                let mut state = self.shared.state.lock();
                if state.aborted {
                    return Err(Error::GeneratorAborted);
                }
                if token.is_some_and(|token| token.is_cancelled()) {
                    return Err(Error::GeneratorAborted);
                }
                if state.closed || state.consumer_gone {
                    // Accepted, but the sequence has ended: never observed.
                    return Ok(());
                }
                match (&self.shared.can_reserve, self.shared.max_items) {
                    (Some(space), Some(max)) if state.queue.len() >= max => space.clone(),
                    _ => {
                        if matches!(item, Item::Completed | Item::Error(_)) {
                            state.closed = true;
                        }
                        state.queue.push_back(item);
                        let now_full = self
                            .shared
                            .max_items
                            .is_some_and(|max| state.queue.len() >= max);
                        drop(state);
                        self.shared.arrived.raise();
                        if now_full
                            && let Some(space) = &self.shared.can_reserve
                        {
                            space.reset();
                        }
                        return Ok(());
                    }
                }
            };
            let outcome = match token {
                Some(token) => space.wait_with(token).await,
                None => space.wait().await,
            };
            outcome.map_err(|_| Error::GeneratorAborted)?;
        }
    }
}

impl<T, E> Drop for Producer<T, E> {
    fn drop(&mut self) {
        let raise = {
            let mut state = self.shared.state.lock();
            if state.closed || state.consumer_gone {
                false
            } else {
                state.closed = true;
                state.queue.push_back(Item::Completed);
                true
            }
        };
        if raise {
            self.shared.arrived.raise();
        }
    }
}

/// Consumer half of a generator: a [`Stream`] of the produced values.
///
/// The stream ends after a completion, yields one final
/// [`Fault::Error`] after a failure, and yields one final
/// [`Fault::Aborted`] when the shared token fires.
pub struct Consumer<T, E = Error> {
    shared: Arc<GeneratorShared<T, E>>,
    pending: Option<crate::queue::Acquire>,
    _not_clone: PhantomData<Cell<()>>, //marker type to avoid cloning implementations
}

enum Step<T, E> {
    Yield(T, bool),
    Fail(E),
    End,
    Wait,
}

impl<T, E> Stream for Consumer<T, E> {
    type Item = Result<T, Fault<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let step = {
                let mut state = this.shared.state.lock();
                if state.finished {
                    Step::End
                } else if state.aborted {
                    state.finished = true;
                    this.pending = None;
                    return Poll::Ready(Some(Err(Fault::Aborted)));
                } else {
                    match state.queue.pop_front() {
                        Some(Item::Value(value)) => Step::Yield(value, state.queue.is_empty()),
                        Some(Item::Completed) => {
                            state.finished = true;
                            Step::End
                        }
                        Some(Item::Error(error)) => {
                            state.finished = true;
                            Step::Fail(error)
                        }
                        None => Step::Wait,
                    }
                }
            };
            match step {
                Step::Yield(value, drained) => {
                    if drained {
                        this.shared.arrived.reset();
                    }
                    if let Some(space) = &this.shared.can_reserve {
                        space.raise();
                    }
                    this.pending = None;
                    return Poll::Ready(Some(Ok(value)));
                }
                Step::Fail(error) => {
                    if let Some(space) = &this.shared.can_reserve {
                        space.raise();
                    }
                    this.pending = None;
                    return Poll::Ready(Some(Err(Fault::Error(error))));
                }
                Step::End => {
                    this.pending = None;
                    return Poll::Ready(None);
                }
                Step::Wait => {
                    if this.pending.is_none() {
                        // The queue is empty, so a still-latched `arrived` is
                        // stale (a raise racing the pop that drained the
                        // queue). Clear it, or the fresh wait below would
                        // resolve on the spot and spin.
                        this.shared.arrived.reset();
                        this.pending = Some(this.shared.arrived.wait());
                    }
                    let wait = this.pending.as_mut().expect("wait installed above");
                    match Pin::new(wait).poll(cx) {
                        // Raised: something arrived (or the token fired);
                        // loop and look at the queue again.
                        Poll::Ready(_) => this.pending = None,
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }
}

impl<T, E> Drop for Consumer<T, E> {
    fn drop(&mut self) {
        {
            self.shared.state.lock().consumer_gone = true;
        }
        // Parked producers wake and see the consumer is gone.
        if let Some(space) = &self.shared.can_reserve {
            space.raise();
        }
    }
}
