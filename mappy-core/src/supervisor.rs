use std::sync::Arc;

use backoff::strategy::exponential::Exponential;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SupervisorSettings;
use crate::error::Result;
use crate::sink::PointSink;
use crate::source::SourceFactory;

/// Runs a source as a supervised background task. A source that fails is restarted after an
/// exponential backoff until `max_restarts` consecutive failures, then the error is returned.
/// A run that stayed up for `healthy_after` starts the count over. Configuration errors and
/// unknown source names are returned right away.
pub struct Supervisor {
    factory: SourceFactory,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(factory: SourceFactory, settings: SupervisorSettings) -> Self {
        Self { factory, settings }
    }

    /// Returns `Ok` when cancelled or when the source ends on its own without an error.
    pub async fn run(
        &self,
        source: &str,
        sink: Arc<dyn PointSink>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut restarts = Exponential::new(
            self.settings.restart_base_delay,
            self.settings.restart_max_delay,
            2.0,
            0.1,
            Some(self.settings.max_restarts),
        );

        loop {
            let started = Instant::now();
            let result = match self
                .factory
                .start(source, Arc::clone(&sink), cancel.child_token())
                .await
            {
                Ok(running) => running.wait().await,
                Err(e) => Err(e),
            };
            if cancel.is_cancelled() {
                info!(source, "Route point source stopped");
                return Ok(());
            }

            let err = match result {
                Ok(()) => {
                    info!(source, "Route point source finished");
                    return Ok(());
                }
                Err(e) => e,
            };
            if err.is_fatal() {
                error!(?err, source, "Route point source cannot be started");
                return Err(err);
            }
            if started.elapsed() >= self.settings.healthy_after {
                restarts.reset();
            }
            let Some(delay) = restarts.next() else {
                error!(?err, source, restarts = restarts.attempt(), "Giving up on route point source");
                return Err(err);
            };
            warn!(?err, source, ?delay, attempt = restarts.attempt(), "Route point source failed, restarting");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
