//! Route points from a partitioned, durable event stream.
//!
//! One task per partition reads batches, decodes every payload into a [`RoutePoint`] and hands
//! it to the sink. Every [`MESSAGES_BETWEEN_CHECKPOINTS`] handled messages the partition position
//! is committed to a [`CheckpointStore`], so a restart replays at most that many messages minus
//! one. A batch that fails (bad payload, sink error, checkpoint error) is redelivered from the
//! last checkpoint to a fresh processor after a backoff; delivery is at-least-once.

use std::sync::Arc;

use async_trait::async_trait;
use backoff::strategy::exponential::Exponential;
use bytes::Bytes;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::point::RoutePoint;
use crate::sink::PointSink;

/// NATS JetStream backend.
pub mod jetstream;

/// In-process backend.
pub mod memory;

/// Handled messages per partition between two checkpoints.
pub const MESSAGES_BETWEEN_CHECKPOINTS: u32 = 100;

const REDELIVERY_BASE_MS: u64 = 200;
const REDELIVERY_MAX_MS: u64 = 10_000;

/// A raw message as delivered by the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub partition: u16,
    /// Position of the message, increasing within a partition.
    pub sequence: u64,
    pub payload: Bytes,
}

/// Last committed position of a partition and the store revision it was committed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub sequence: u64,
    pub revision: u64,
}

/// Why a partition processor was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    /// Another owner committed a newer checkpoint for the partition.
    LeaseLost,
    /// Processing a batch failed; the partition is redelivered from its last checkpoint.
    Faulted,
}

#[async_trait]
pub trait EventStream: Send + Sync {
    fn partitions(&self) -> Vec<u16>;

    /// Opens `partition` right after position `after`, or at its start when `None`.
    async fn open_partition(
        &self,
        partition: u16,
        after: Option<u64>,
    ) -> Result<Box<dyn PartitionReader>>;
}

#[async_trait]
pub trait PartitionReader: Send {
    /// Next batch of messages, possibly empty when nothing arrived in time. `None` once the
    /// partition has ended.
    async fn next_batch(&mut self) -> Result<Option<Vec<StreamEvent>>>;
}

/// Durable per-partition positions of one consumer group.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, partition: u16) -> Result<Option<Checkpoint>>;

    /// Commits `sequence` if the stored revision is still `expected_revision` (`None` when
    /// nothing was committed yet) and returns the new revision. Fails with
    /// [`Error::LeaseLost`] when someone else committed in between.
    async fn commit(
        &self,
        partition: u16,
        sequence: u64,
        expected_revision: Option<u64>,
    ) -> Result<u64>;
}

/// The pair of handles a stream source needs: the stream itself and, over a separate
/// connection, the checkpoint store.
#[derive(Clone)]
pub struct StreamBackend {
    pub stream: Arc<dyn EventStream>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// What a processor knows about the partition it is working on.
pub struct PartitionContext {
    partition: u16,
    checkpoints: Arc<dyn CheckpointStore>,
    revision: Option<u64>,
    last_checkpoint: Option<u64>,
}

impl PartitionContext {
    pub fn new(
        partition: u16,
        checkpoints: Arc<dyn CheckpointStore>,
        checkpoint: Option<Checkpoint>,
    ) -> Self {
        Self {
            partition,
            checkpoints,
            revision: checkpoint.map(|c| c.revision),
            last_checkpoint: checkpoint.map(|c| c.sequence),
        }
    }

    pub fn partition(&self) -> u16 {
        self.partition
    }

    /// Position the partition resumes after.
    pub fn last_checkpoint(&self) -> Option<u64> {
        self.last_checkpoint
    }

    /// Commits `event` as the partition position.
    pub async fn checkpoint(&mut self, event: &StreamEvent) -> Result<()> {
        let revision = self
            .checkpoints
            .commit(self.partition, event.sequence, self.revision)
            .await?;
        self.revision = Some(revision);
        self.last_checkpoint = Some(event.sequence);
        info!(partition = self.partition, sequence = event.sequence, "Checkpointed partition");
        Ok(())
    }
}

/// Decodes the batches of one partition and forwards the points to the sink.
pub struct RoutePointProcessor {
    sink: Arc<dyn PointSink>,
    until_checkpoint: u32,
}

impl RoutePointProcessor {
    pub fn new(sink: Arc<dyn PointSink>) -> Self {
        Self {
            sink,
            until_checkpoint: MESSAGES_BETWEEN_CHECKPOINTS,
        }
    }

    /// Messages left before the next checkpoint.
    pub fn until_checkpoint(&self) -> u32 {
        self.until_checkpoint
    }

    pub fn open(&self, ctx: &PartitionContext) {
        info!(
            partition = ctx.partition,
            after = ?ctx.last_checkpoint,
            "Route point processor opened"
        );
    }

    pub fn close(&self, ctx: &PartitionContext, reason: CloseReason) {
        info!(partition = ctx.partition, ?reason, "Route point processor closed");
    }

    /// Handles a batch in order. The first failing message aborts the batch; messages handled
    /// before it stay handled.
    pub async fn process_batch(
        &mut self,
        ctx: &mut PartitionContext,
        events: Vec<StreamEvent>,
    ) -> Result<()> {
        for event in events {
            let point = RoutePoint::from_wire(&event.payload).inspect_err(|e| {
                error!(
                    ?e,
                    partition = event.partition,
                    sequence = event.sequence,
                    payload = %String::from_utf8_lossy(&event.payload),
                    "Failed to decode route point"
                );
            })?;
            info!(
                user_id = point.user_id,
                latitude = point.latitude,
                longitude = point.longitude,
                "Route point from stream"
            );
            self.sink.publish(&point).inspect_err(|e| {
                error!(?e, user_id = point.user_id, sequence = event.sequence, "Sink failed");
            })?;

            self.until_checkpoint -= 1;
            if self.until_checkpoint == 0 {
                ctx.checkpoint(&event).await?;
                self.until_checkpoint = MESSAGES_BETWEEN_CHECKPOINTS;
            }
        }
        Ok(())
    }
}

/// Consumes every partition of an event stream on behalf of one consumer group.
pub struct StreamCheckpointSource {
    backend: StreamBackend,
    sink: Arc<dyn PointSink>,
    max_redeliveries: u16,
}

impl StreamCheckpointSource {
    pub fn new(backend: StreamBackend, sink: Arc<dyn PointSink>, max_redeliveries: u16) -> Self {
        Self {
            backend,
            sink,
            max_redeliveries,
        }
    }

    /// Attaches to every partition, then hands the partitions to background tasks. Returns once
    /// all partitions are attached. The returned task finishes when every partition has been
    /// shut down or released, or with the first partition error, which stops the others.
    pub async fn start(self, cancel: CancellationToken) -> Result<JoinHandle<Result<()>>> {
        let partitions = self.backend.stream.partitions();
        if partitions.is_empty() {
            return Err(Error::Stream("event stream has no partitions".to_string()));
        }

        let mut attached = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let checkpoint = self.backend.checkpoints.load(partition).await?;
            let reader = self
                .backend
                .stream
                .open_partition(partition, checkpoint.map(|c| c.sequence))
                .await?;
            let ctx = PartitionContext::new(
                partition,
                Arc::clone(&self.backend.checkpoints),
                checkpoint,
            );
            attached.push((reader, ctx));
        }
        info!(partitions = attached.len(), "Attached to event stream");

        let partition_cancel = cancel.child_token();
        let mut tasks = JoinSet::new();
        for (reader, ctx) in attached {
            let pump = PartitionPump {
                backend: self.backend.clone(),
                sink: Arc::clone(&self.sink),
                max_redeliveries: self.max_redeliveries,
                cancel: partition_cancel.clone(),
            };
            tasks.spawn(pump.run(reader, ctx));
        }

        Ok(tokio::spawn(async move {
            let mut outcome = Ok(());
            while let Some(joined) = tasks.join_next().await {
                let result = joined.map_err(Error::from).and_then(|r| r);
                if let Err(e) = result {
                    error!(?e, "Partition failed, stopping the stream source");
                    partition_cancel.cancel();
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
            outcome
        }))
    }
}

struct PartitionPump {
    backend: StreamBackend,
    sink: Arc<dyn PointSink>,
    max_redeliveries: u16,
    cancel: CancellationToken,
}

impl PartitionPump {
    async fn run(
        self,
        mut reader: Box<dyn PartitionReader>,
        mut ctx: PartitionContext,
    ) -> Result<()> {
        let partition = ctx.partition;
        let mut redeliveries = Exponential::from_millis(
            REDELIVERY_BASE_MS,
            REDELIVERY_MAX_MS,
            2.0,
            0.1,
            Some(self.max_redeliveries),
        );
        let mut processor = RoutePointProcessor::new(Arc::clone(&self.sink));
        processor.open(&ctx);

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    processor.close(&ctx, CloseReason::Shutdown);
                    return Ok(());
                }
                batch = reader.next_batch() => batch,
            };

            let outcome = match batch {
                Ok(Some(events)) if events.is_empty() => continue,
                Ok(Some(events)) => processor.process_batch(&mut ctx, events).await,
                Ok(None) => {
                    processor.close(&ctx, CloseReason::Shutdown);
                    return Ok(());
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => redeliveries.reset(),
                Err(Error::LeaseLost(_)) => {
                    processor.close(&ctx, CloseReason::LeaseLost);
                    return Ok(());
                }
                Err(e) => {
                    processor.close(&ctx, CloseReason::Faulted);
                    let Some(delay) = redeliveries.next() else {
                        error!(partition, ?e, "Giving up on partition after repeated failures");
                        return Err(e);
                    };
                    warn!(partition, ?e, ?delay, "Batch failed, redelivering from last checkpoint");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }

                    let checkpoint = self.backend.checkpoints.load(partition).await?;
                    if checkpoint.map(|c| c.revision) != ctx.revision {
                        info!(partition, "Checkpoint moved while redelivering, releasing partition");
                        return Ok(());
                    }
                    reader = self
                        .backend
                        .stream
                        .open_partition(partition, checkpoint.map(|c| c.sequence))
                        .await?;
                    ctx = PartitionContext::new(
                        partition,
                        Arc::clone(&self.backend.checkpoints),
                        checkpoint,
                    );
                    processor = RoutePointProcessor::new(Arc::clone(&self.sink));
                    processor.open(&ctx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use parking_lot::Mutex;

    use super::memory::{MemoryCheckpointStore, MemoryEventStream};
    use super::*;

    fn payload(user: &str) -> Bytes {
        Bytes::from(
            RoutePoint::new(user, 47.6, -122.33, Utc::now())
                .to_wire()
                .unwrap(),
        )
    }

    fn backend(stream: &Arc<MemoryEventStream>, checkpoints: &Arc<MemoryCheckpointStore>) -> StreamBackend {
        StreamBackend {
            stream: Arc::clone(stream) as Arc<dyn EventStream>,
            checkpoints: Arc::clone(checkpoints) as Arc<dyn CheckpointStore>,
        }
    }

    fn counting_sink() -> (Arc<AtomicUsize>, Arc<dyn PointSink>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sink = move |_: &RoutePoint| -> Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        (count, Arc::new(sink))
    }

    #[tokio::test]
    async fn checkpoints_every_hundred_messages() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut ctx = PartitionContext::new(
            0,
            Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
            None,
        );
        let (count, sink) = counting_sink();
        let mut processor = RoutePointProcessor::new(sink);

        let events: Vec<_> = (1..=250)
            .map(|sequence| StreamEvent {
                partition: 0,
                sequence,
                payload: payload(&(sequence % 9 + 1).to_string()),
            })
            .collect();
        for batch in events.chunks(30) {
            processor.process_batch(&mut ctx, batch.to_vec()).await.unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 250);
        assert_eq!(checkpoints.commits(), vec![(0, 100), (0, 200)]);
        assert_eq!(processor.until_checkpoint(), 50);
        assert_eq!(ctx.last_checkpoint(), Some(200));
    }

    #[tokio::test]
    async fn decode_failure_aborts_batch_without_rollback() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut ctx = PartitionContext::new(
            0,
            Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
            None,
        );
        let (count, sink) = counting_sink();
        let mut processor = RoutePointProcessor::new(sink);

        let events = vec![
            StreamEvent { partition: 0, sequence: 1, payload: payload("1") },
            StreamEvent { partition: 0, sequence: 2, payload: Bytes::from_static(b"{garbage") },
            StreamEvent { partition: 0, sequence: 3, payload: payload("3") },
        ];
        let result = processor.process_batch(&mut ctx, events).await;
        assert!(matches!(result, Err(Error::Decode(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(processor.until_checkpoint(), MESSAGES_BETWEEN_CHECKPOINTS - 1);
    }

    #[tokio::test]
    async fn stale_revision_is_lease_lost() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut ctx = PartitionContext::new(
            3,
            Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>,
            None,
        );
        // another owner got there first
        checkpoints.commit(3, 40, None).await.unwrap();

        let event = StreamEvent { partition: 3, sequence: 10, payload: payload("1") };
        assert!(matches!(ctx.checkpoint(&event).await, Err(Error::LeaseLost(3))));
        assert_eq!(ctx.last_checkpoint(), None);
    }

    #[tokio::test]
    async fn source_drains_all_partitions() {
        let stream = Arc::new(MemoryEventStream::new(3, 25));
        for n in 0..300 {
            stream.push(n % 3, payload(&(n % 7 + 1).to_string())).unwrap();
        }
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let (count, sink) = counting_sink();

        let source = StreamCheckpointSource::new(backend(&stream, &checkpoints), sink, 3);
        let handle = source.start(CancellationToken::new()).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 300);
        let mut commits = checkpoints.commits();
        commits.sort();
        assert_eq!(commits, vec![(0, 100), (1, 100), (2, 100)]);
    }

    #[tokio::test]
    async fn resumes_after_last_checkpoint() {
        let stream = Arc::new(MemoryEventStream::new(1, 50));
        for n in 0..150 {
            stream.push(0, payload(&(n % 5 + 1).to_string())).unwrap();
        }
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        checkpoints.commit(0, 120, None).await.unwrap();
        let (count, sink) = counting_sink();

        let source = StreamCheckpointSource::new(backend(&stream, &checkpoints), sink, 3);
        source.start(CancellationToken::new()).await.unwrap().await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_redelivers_from_checkpoint() {
        let stream = Arc::new(MemoryEventStream::new(1, 40));
        for n in 1..=250 {
            let user = if n == 150 { "flaky".to_string() } else { (n % 9 + 1).to_string() };
            stream.push(0, payload(&user)).unwrap();
        }
        let checkpoints = Arc::new(MemoryCheckpointStore::new());

        let delivered = Arc::new(AtomicUsize::new(0));
        let failed_once = Arc::new(AtomicUsize::new(0));
        let (counter, failures) = (Arc::clone(&delivered), Arc::clone(&failed_once));
        let sink = move |point: &RoutePoint| -> Result<()> {
            if point.user_id == "flaky" && failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::Sink("subscriber went away".into()));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        let source =
            StreamCheckpointSource::new(backend(&stream, &checkpoints), Arc::new(sink), 3);
        source.start(CancellationToken::new()).await.unwrap().await.unwrap().unwrap();

        // 101..=149 are delivered twice
        assert_eq!(delivered.load(Ordering::SeqCst), 250 + 49);
        assert_eq!(checkpoints.commits(), vec![(0, 100), (0, 200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn poison_message_exhausts_redeliveries() {
        let stream = Arc::new(MemoryEventStream::new(2, 10));
        for n in 1..=20 {
            stream.push(1, payload(&n.to_string())).unwrap();
        }
        stream.push(1, Bytes::from_static(b"not a route point")).unwrap();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let (count, sink) = counting_sink();

        let source = StreamCheckpointSource::new(backend(&stream, &checkpoints), sink, 2);
        let result = source.start(CancellationToken::new()).await.unwrap().await.unwrap();
        assert!(matches!(result, Err(Error::Decode(_))));
        // first delivery plus two redeliveries of partition 1
        assert_eq!(count.load(Ordering::SeqCst), 20 * 3);
    }

    #[tokio::test]
    async fn lost_lease_releases_partition() {
        let stream = Arc::new(MemoryEventStream::new(1, 20));
        for n in 0..150 {
            stream.push(0, payload(&(n % 5 + 1).to_string())).unwrap();
        }
        let checkpoints = Arc::new(MemoryCheckpointStore::new());

        let seen = Arc::new(Mutex::new(0usize));
        let (counter, thief) = (Arc::clone(&seen), Arc::clone(&checkpoints));
        let sink = move |_: &RoutePoint| -> Result<()> {
            let mut seen = counter.lock();
            *seen += 1;
            if *seen == 50 {
                thief.steal(0, 500);
            }
            Ok(())
        };

        let source =
            StreamCheckpointSource::new(backend(&stream, &checkpoints), Arc::new(sink), 3);
        source.start(CancellationToken::new()).await.unwrap().await.unwrap().unwrap();

        // stopped at the first checkpoint attempt
        assert_eq!(*seen.lock(), 100);
        assert_eq!(checkpoints.commits(), vec![(0, 500)]);
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let stream = Arc::new(MemoryEventStream::new(0, 10));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let (_, sink) = counting_sink();
        let source = StreamCheckpointSource::new(backend(&stream, &checkpoints), sink, 3);
        assert!(matches!(
            source.start(CancellationToken::new()).await,
            Err(Error::Stream(_))
        ));
    }
}
