//! Retry an async operation with a backoff strategy.
//!
//! A strategy is any iterator of [`std::time::Duration`]s: each item is the cool-off before the next
//! attempt, and the iterator running dry ends the retries.
//!
//! ```ignore
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! let interval = fixed::Interval::from_millis(100).take(5);
//! let value = Retry::retry(interval, || async { connect().await }, |_: &Error| true).await?;
//! ```

use std::future::Future;

pub mod retry;
pub mod strategy;

/// A retryable unit of work. Implemented for every `FnMut() -> impl Future<Output = Result<..>>`.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    T: Future<Output = Result<I, E>>,
    F: FnMut() -> T,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether an error is worth another attempt.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
