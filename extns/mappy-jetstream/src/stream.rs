//! Partitioned stream on top of a single JetStream stream.

use std::time::Duration;

use async_nats::jetstream::Context;
use async_nats::jetstream::Message as JetstreamMessage;
use async_nats::jetstream::consumer::pull::{Config, Stream};
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream;
use bytes::Bytes;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::{ConnectionConfig, Error, Result, connect, partition_for_key, partition_subject};

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionedStreamConfig {
    pub connection: ConnectionConfig,
    pub stream: String,
    pub partitions: u16,
    pub batch_size: usize,
    pub read_timeout: Duration,
}

/// Handle on a partitioned stream, used both by producers and by partition readers.
#[derive(Clone)]
pub struct PartitionedStream {
    js_ctx: Context,
    stream: stream::Stream,
    name: String,
    partitions: u16,
    batch_size: usize,
    read_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub partition: u16,
    pub stream_sequence: u64,
    pub payload: Bytes,
}

impl StreamMessage {
    fn from_jetstream(partition: u16, msg: JetstreamMessage) -> Result<Self> {
        let stream_sequence = msg
            .info()
            .map_err(|e| {
                Error::Jetstream(format!("fetching message metadata from Jetstream: {e:?}"))
            })?
            .stream_sequence;
        Ok(StreamMessage {
            partition,
            stream_sequence,
            payload: msg.message.payload,
        })
    }
}

impl PartitionedStream {
    /// Connects and makes sure the stream exists with one subject per partition.
    pub async fn connect(config: PartitionedStreamConfig) -> Result<Self> {
        if config.partitions == 0 {
            return Err(Error::Other(format!(
                "stream {} needs at least one partition",
                config.stream
            )));
        }
        let js_ctx = connect(&config.connection).await?;
        let stream = js_ctx
            .get_or_create_stream(stream::Config {
                name: config.stream.clone(),
                subjects: vec![format!("{}.*", config.stream)],
                ..Default::default()
            })
            .await
            .map_err(|e| {
                Error::Jetstream(format!("getting or creating stream {}: {e:?}", config.stream))
            })?;
        info!(stream = config.stream, partitions = config.partitions, "Attached to stream");

        Ok(Self {
            js_ctx,
            stream,
            name: config.stream,
            partitions: config.partitions,
            batch_size: config.batch_size.max(1),
            read_timeout: config.read_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partitions(&self) -> u16 {
        self.partitions
    }

    /// Publishes `payload` to the partition owning `key` and waits for the server ack.
    /// Returns the partition and the stream sequence the message was stored at.
    pub async fn publish(&self, key: &str, payload: Bytes) -> Result<(u16, u64)> {
        let partition = partition_for_key(key, self.partitions);
        let subject = partition_subject(&self.name, partition);
        let ack = self
            .js_ctx
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| Error::Jetstream(format!("publishing to {subject}: {e:?}")))?
            .await
            .map_err(|e| Error::Jetstream(format!("waiting for ack on {subject}: {e:?}")))?;
        Ok((partition, ack.sequence))
    }

    /// Opens a reader for `partition` that starts right after stream sequence `after`, or at
    /// the beginning of the partition when `after` is `None`.
    pub async fn open_reader(&self, partition: u16, after: Option<u64>) -> Result<PartitionReader> {
        if partition >= self.partitions {
            return Err(Error::Other(format!(
                "partition {partition} out of range, stream {} has {}",
                self.name, self.partitions
            )));
        }
        let deliver_policy = match after {
            Some(sequence) => DeliverPolicy::ByStartSequence {
                start_sequence: sequence + 1,
            },
            None => DeliverPolicy::All,
        };
        let filter_subject = partition_subject(&self.name, partition);
        let consumer = self
            .stream
            .create_consumer(Config {
                filter_subject: filter_subject.clone(),
                deliver_policy,
                ack_policy: AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                Error::Jetstream(format!("creating consumer for {filter_subject}: {e:?}"))
            })?;
        let messages = consumer.messages().await.map_err(|e| {
            Error::Jetstream(format!("opening message stream for {filter_subject}: {e:?}"))
        })?;
        debug!(partition, ?after, "Opened partition reader");

        Ok(PartitionReader {
            partition,
            messages,
            batch_size: self.batch_size,
            read_timeout: self.read_timeout,
        })
    }
}

/// Reads one partition in batches.
pub struct PartitionReader {
    partition: u16,
    messages: Stream,
    batch_size: usize,
    read_timeout: Duration,
}

impl PartitionReader {
    pub fn partition(&self) -> u16 {
        self.partition
    }

    /// Collects up to `batch_size` messages or whatever arrived before the read timeout.
    /// Returns `None` once the underlying message stream has ended and nothing was read.
    pub async fn read_messages(&mut self) -> Result<Option<Vec<StreamMessage>>> {
        let mut messages: Vec<StreamMessage> = Vec::with_capacity(self.batch_size);
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                biased;

                _ = &mut timeout => {
                    break;
                }

                message = self.messages.next() => {
                    let Some(message) = message else {
                        if messages.is_empty() {
                            return Ok(None);
                        }
                        break;
                    };
                    let message = message.map_err(|e| {
                        Error::Jetstream(format!("Getting next message from the stream: {e:?}"))
                    })?;
                    messages.push(StreamMessage::from_jetstream(self.partition, message)?);
                    if messages.len() >= self.batch_size {
                        break;
                    }
                }
            }
        }
        Ok(Some(messages))
    }
}
