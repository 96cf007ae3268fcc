use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::source::stream::{
    Checkpoint, CheckpointStore, EventStream, PartitionReader, StreamEvent,
};

/// Partitioned stream kept in memory. Sequences start at 1 in every partition. A reader hands
/// out what was pushed up to the moment it is polled and then reports the end of the partition.
pub struct MemoryEventStream {
    partitions: Arc<Mutex<Vec<Vec<Bytes>>>>,
    batch_size: usize,
}

impl MemoryEventStream {
    pub fn new(partitions: u16, batch_size: usize) -> Self {
        Self {
            partitions: Arc::new(Mutex::new(vec![Vec::new(); partitions as usize])),
            batch_size: batch_size.max(1),
        }
    }

    /// Appends `payload` to `partition` and returns its sequence.
    pub fn push(&self, partition: u16, payload: Bytes) -> Result<u64> {
        let mut partitions = self.partitions.lock();
        let events = partitions
            .get_mut(partition as usize)
            .ok_or_else(|| Error::Stream(format!("no partition {partition}")))?;
        events.push(payload);
        Ok(events.len() as u64)
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    fn partitions(&self) -> Vec<u16> {
        (0..self.partitions.lock().len() as u16).collect()
    }

    async fn open_partition(
        &self,
        partition: u16,
        after: Option<u64>,
    ) -> Result<Box<dyn PartitionReader>> {
        if partition as usize >= self.partitions.lock().len() {
            return Err(Error::Stream(format!("no partition {partition}")));
        }
        Ok(Box::new(MemoryPartitionReader {
            partitions: Arc::clone(&self.partitions),
            partition,
            next: after.unwrap_or(0) + 1,
            batch_size: self.batch_size,
        }))
    }
}

struct MemoryPartitionReader {
    partitions: Arc<Mutex<Vec<Vec<Bytes>>>>,
    partition: u16,
    next: u64,
    batch_size: usize,
}

#[async_trait]
impl PartitionReader for MemoryPartitionReader {
    async fn next_batch(&mut self) -> Result<Option<Vec<StreamEvent>>> {
        let partitions = self.partitions.lock();
        let events = partitions
            .get(self.partition as usize)
            .ok_or_else(|| Error::Stream(format!("no partition {}", self.partition)))?;

        let batch: Vec<StreamEvent> = events
            .iter()
            .enumerate()
            .skip((self.next - 1) as usize)
            .take(self.batch_size)
            .map(|(idx, payload)| StreamEvent {
                partition: self.partition,
                sequence: idx as u64 + 1,
                payload: payload.clone(),
            })
            .collect();
        if batch.is_empty() {
            return Ok(None);
        }
        self.next += batch.len() as u64;
        Ok(Some(batch))
    }
}

/// Checkpoints kept in memory, with compare-and-set on the revision.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<MemoryCheckpoints>,
}

#[derive(Debug, Default)]
struct MemoryCheckpoints {
    entries: HashMap<u16, Checkpoint>,
    revision: u64,
    history: Vec<(u16, u64)>,
}

impl MemoryCheckpoints {
    fn write(&mut self, partition: u16, sequence: u64) -> u64 {
        self.revision += 1;
        let revision = self.revision;
        self.entries.insert(partition, Checkpoint { sequence, revision });
        self.history.push((partition, sequence));
        revision
    }
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful commit as (partition, sequence), oldest first.
    pub fn commits(&self) -> Vec<(u16, u64)> {
        self.inner.lock().history.clone()
    }

    /// Commits on behalf of another owner, ignoring the current revision.
    pub fn steal(&self, partition: u16, sequence: u64) -> u64 {
        self.inner.lock().write(partition, sequence)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, partition: u16) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().entries.get(&partition).copied())
    }

    async fn commit(
        &self,
        partition: u16,
        sequence: u64,
        expected_revision: Option<u64>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let current = inner.entries.get(&partition).map(|c| c.revision);
        if current != expected_revision {
            return Err(Error::LeaseLost(partition));
        }
        Ok(inner.write(partition, sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_batches_and_resumes() {
        let stream = MemoryEventStream::new(2, 2);
        for n in 0..5 {
            assert_eq!(stream.push(1, Bytes::from(format!("{n}"))).unwrap(), n + 1);
        }
        assert_eq!(stream.partitions(), vec![0, 1]);

        let mut reader = stream.open_partition(1, Some(2)).await.unwrap();
        let first = reader.next_batch().await.unwrap().unwrap();
        assert_eq!(
            first.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );
        let second = reader.next_batch().await.unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, Bytes::from("4"));
        assert!(reader.next_batch().await.unwrap().is_none());

        assert!(stream.open_partition(2, None).await.is_err());
    }

    #[tokio::test]
    async fn commit_is_compare_and_set() {
        let store = MemoryCheckpointStore::new();
        let first = store.commit(0, 100, None).await.unwrap();
        assert!(matches!(store.commit(0, 150, None).await, Err(Error::LeaseLost(0))));
        let second = store.commit(0, 200, Some(first)).await.unwrap();
        assert_eq!(
            store.load(0).await.unwrap(),
            Some(Checkpoint {
                sequence: 200,
                revision: second
            })
        );
        assert_eq!(store.load(1).await.unwrap(), None);
        assert_eq!(store.commits(), vec![(0, 100), (0, 200)]);
    }
}
