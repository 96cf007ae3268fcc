use std::time::Duration;

use tracing::warn;

use crate::{Condition, Operation};

/// Retry runs an [`Operation`] until it succeeds, the [`Condition`] rejects the error, or the
/// backoff strategy runs out of delays. The first run is not a retry, so a strategy yielding
/// `n` delays allows `n + 1` runs in total.
pub struct Retry;

impl Retry {
    pub async fn retry<S, O, C>(strategy: S, mut operation: O, mut condition: C) -> Result<O::Item, O::Error>
    where
        S: IntoIterator<Item = Duration>,
        O: Operation,
        O::Error: std::fmt::Debug,
        C: Condition<O::Error>,
    {
        let mut delays = strategy.into_iter();
        let mut attempt: usize = 1;
        loop {
            let err = match operation.run().await {
                Ok(item) => return Ok(item),
                Err(err) => err,
            };

            if !condition.can_retry(&err) {
                return Err(err);
            }

            let Some(delay) = delays.next() else {
                return Err(err);
            };

            warn!(attempt, ?delay, ?err, "Operation failed, retrying after backoff");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
