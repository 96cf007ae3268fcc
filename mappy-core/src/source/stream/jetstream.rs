use std::sync::Arc;

use async_trait::async_trait;
use mappy_jetstream::checkpoint::{CheckpointBucket, checkpoint_key};
use mappy_jetstream::stream::PartitionedStream;

use crate::config::StreamSettings;
use crate::error::{Error, Result};
use crate::source::stream::{
    Checkpoint, CheckpointStore, EventStream, PartitionReader, StreamBackend, StreamEvent,
};

/// Connects the partitioned stream and, over its own connection, the checkpoint bucket.
pub async fn connect(settings: &StreamSettings) -> Result<StreamBackend> {
    let stream = PartitionedStream::connect(settings.stream_config()).await?;
    let bucket =
        CheckpointBucket::connect(&settings.checkpoint_connection, &settings.checkpoint_bucket)
            .await?;

    Ok(StreamBackend {
        stream: Arc::new(JetstreamEventStream { stream }),
        checkpoints: Arc::new(JetstreamCheckpointStore {
            bucket,
            consumer_group: settings.consumer_group.clone(),
            stream: settings.stream.clone(),
        }),
    })
}

pub struct JetstreamEventStream {
    stream: PartitionedStream,
}

#[async_trait]
impl EventStream for JetstreamEventStream {
    fn partitions(&self) -> Vec<u16> {
        (0..self.stream.partitions()).collect()
    }

    async fn open_partition(
        &self,
        partition: u16,
        after: Option<u64>,
    ) -> Result<Box<dyn PartitionReader>> {
        let reader = self.stream.open_reader(partition, after).await?;
        Ok(Box::new(JetstreamPartitionReader { reader }))
    }
}

struct JetstreamPartitionReader {
    reader: mappy_jetstream::stream::PartitionReader,
}

#[async_trait]
impl PartitionReader for JetstreamPartitionReader {
    async fn next_batch(&mut self) -> Result<Option<Vec<StreamEvent>>> {
        let Some(messages) = self.reader.read_messages().await? else {
            return Ok(None);
        };
        Ok(Some(
            messages
                .into_iter()
                .map(|msg| StreamEvent {
                    partition: msg.partition,
                    sequence: msg.stream_sequence,
                    payload: msg.payload,
                })
                .collect(),
        ))
    }
}

pub struct JetstreamCheckpointStore {
    bucket: CheckpointBucket,
    consumer_group: String,
    stream: String,
}

impl JetstreamCheckpointStore {
    fn key(&self, partition: u16) -> String {
        checkpoint_key(&self.consumer_group, &self.stream, partition)
    }
}

#[async_trait]
impl CheckpointStore for JetstreamCheckpointStore {
    async fn load(&self, partition: u16) -> Result<Option<Checkpoint>> {
        let stored = self
            .bucket
            .load(&self.key(partition))
            .await
            .map_err(|e| Error::Checkpoint(e.to_string()))?;
        Ok(stored.map(|c| Checkpoint {
            sequence: c.sequence,
            revision: c.revision,
        }))
    }

    async fn commit(
        &self,
        partition: u16,
        sequence: u64,
        expected_revision: Option<u64>,
    ) -> Result<u64> {
        match self
            .bucket
            .commit(&self.key(partition), sequence, expected_revision)
            .await
        {
            Ok(revision) => Ok(revision),
            Err(mappy_jetstream::Error::RevisionConflict { .. }) => {
                Err(Error::LeaseLost(partition))
            }
            Err(e) => Err(Error::Checkpoint(e.to_string())),
        }
    }
}

#[cfg(all(test, feature = "nats-tests"))]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use mappy_jetstream::ConnectionConfig;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::point::RoutePoint;
    use crate::sink::PointSink;
    use crate::source::stream::StreamCheckpointSource;

    fn settings(stream: &str) -> StreamSettings {
        let connection = ConnectionConfig {
            addr: "localhost:4222".to_string(),
            auth: None,
        };
        StreamSettings {
            connection: connection.clone(),
            stream: stream.to_string(),
            partitions: 2,
            consumer_group: "tests".to_string(),
            checkpoint_connection: connection,
            checkpoint_bucket: format!("{stream}-checkpoints"),
            batch_size: 50,
            read_timeout: Duration::from_millis(200),
            max_redeliveries: 2,
        }
    }

    #[tokio::test]
    async fn stream_source_checkpoints_to_kv() {
        let name = format!("mappy_core_{}", Utc::now().timestamp_millis());
        let settings = settings(&name);
        let producer = PartitionedStream::connect(settings.stream_config())
            .await
            .unwrap();
        for _ in 0..100 {
            let point = RoutePoint::new("7", 47.6, -122.3, Utc::now());
            producer
                .publish(&point.user_id, Bytes::from(point.to_wire().unwrap()))
                .await
                .unwrap();
        }

        let backend = connect(&settings).await.unwrap();
        let checkpoints = Arc::clone(&backend.checkpoints);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = move |point: &RoutePoint| -> Result<()> {
            let _ = tx.send(point.clone());
            Ok(())
        };
        let sink: Arc<dyn PointSink> = Arc::new(sink);

        let cancel = CancellationToken::new();
        let handle = StreamCheckpointSource::new(backend, sink, 2)
            .start(cancel.clone())
            .await
            .unwrap();
        for _ in 0..100 {
            rx.recv().await.unwrap();
        }
        // the checkpoint is committed right after the hundredth point
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let partition = mappy_jetstream::partition_for_key("7", 2);
        let checkpoint = checkpoints.load(partition).await.unwrap().unwrap();
        assert!(checkpoint.sequence >= 100);
    }
}
