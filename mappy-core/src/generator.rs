//! Feeds synthetic route points into the event stream or the point store, so the other sources
//! have something to read.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mappy_jetstream::stream::PartitionedStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RandomSettings;
use crate::error::{Error, Result};
use crate::point::RoutePoint;
use crate::sink::PointSink;
use crate::source::random::RandomWalkSource;
use crate::store::RoutePointStore;

const GENERATOR_BUFFER: usize = 1024;

/// Where generated points end up.
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, point: &RoutePoint) -> Result<()>;
}

/// Publishes the wire format to the event stream, keyed by user id.
pub struct StreamWriter {
    stream: PartitionedStream,
}

impl StreamWriter {
    pub fn new(stream: PartitionedStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl PointWriter for StreamWriter {
    async fn write(&self, point: &RoutePoint) -> Result<()> {
        let payload = Bytes::from(point.to_wire()?);
        let (partition, sequence) = self.stream.publish(&point.user_id, payload).await?;
        debug!(user_id = point.user_id, partition, sequence, "Published route point");
        Ok(())
    }
}

/// Appends to the point store.
pub struct StoreWriter {
    store: Arc<dyn RoutePointStore>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn RoutePointStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PointWriter for StoreWriter {
    async fn write(&self, point: &RoutePoint) -> Result<()> {
        let stored = self.store.append(point).await?;
        debug!(user_id = point.user_id, row_key = stored.row_key, "Stored route point");
        Ok(())
    }
}

/// Hands points over to the writer task without blocking the random source.
struct ChannelSink {
    tx: mpsc::Sender<RoutePoint>,
}

impl PointSink for ChannelSink {
    fn publish(&self, point: &RoutePoint) -> Result<()> {
        self.tx
            .try_send(point.clone())
            .map_err(|e| Error::Sink(format!("generator buffer: {e}")))
    }
}

pub struct Generator {
    settings: RandomSettings,
    writer: Arc<dyn PointWriter>,
    limit: Option<u64>,
}

impl Generator {
    /// `limit` bounds the number of points written, `None` runs until cancelled.
    pub fn new(settings: RandomSettings, writer: Arc<dyn PointWriter>, limit: Option<u64>) -> Self {
        Self {
            settings,
            writer,
            limit,
        }
    }

    /// Returns the number of points written. A write failure stops the generator.
    pub async fn run(self, cancel: CancellationToken) -> Result<u64> {
        let (tx, mut rx) = mpsc::channel(GENERATOR_BUFFER);
        let source = RandomWalkSource::new(&self.settings, Arc::new(ChannelSink { tx }))?;
        let source_cancel = cancel.child_token();
        let source_task = tokio::spawn(source.run(source_cancel.clone()));
        info!(limit = ?self.limit, "Generator started");

        let mut written: u64 = 0;
        let outcome = loop {
            if self.limit.is_some_and(|limit| written >= limit) {
                break Ok(());
            }
            let point = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                point = rx.recv() => point,
            };
            let Some(point) = point else {
                break Ok(());
            };
            if let Err(e) = self.writer.write(&point).await {
                break Err(e);
            }
            written += 1;
        };

        source_cancel.cancel();
        source_task.await??;
        info!(written, "Generator stopped");
        outcome.map(|()| written)
    }
}
