//! Partition checkpoints kept in a JetStream key-value bucket.
//!
//! Every commit carries the revision the committer last saw. A mismatch means some other
//! consumer moved the checkpoint in the meantime, i.e. the partition lease was lost.

use async_nats::jetstream::kv::{self, Operation, Store};
use bytes::Bytes;
use tracing::info;

use crate::{ConnectionConfig, Error, Result, connect};

/// A committed position together with the KV revision it was written at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub sequence: u64,
    pub revision: u64,
}

#[derive(Clone)]
pub struct CheckpointBucket {
    store: Store,
    bucket: String,
}

/// Key under which a consumer group stores its position for one partition of a stream.
///
/// KV keys only allow a restricted alphabet. Letters, digits and `-` are kept, `_` becomes `__`
/// and every other byte becomes `_` followed by two hex digits, so distinct names never share a
/// key.
pub fn checkpoint_key(consumer_group: &str, stream: &str, partition: u16) -> String {
    format!("{}.{}.{partition}", escape_key_part(consumer_group), escape_key_part(stream))
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for byte in part.bytes() {
        match byte {
            b'_' => escaped.push_str("__"),
            b if b.is_ascii_alphanumeric() || b == b'-' => escaped.push(char::from(b)),
            b => escaped.push_str(&format!("_{b:02x}")),
        }
    }
    escaped
}

impl CheckpointBucket {
    /// Connects to the checkpoint server and opens `bucket`, creating it when missing.
    pub async fn connect(connection: &ConnectionConfig, bucket: &str) -> Result<Self> {
        let js_ctx = connect(connection).await?;
        let store = match js_ctx.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => js_ctx
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Jetstream(format!("creating KV bucket {bucket}: {e:?}")))?,
        };
        info!(bucket, "Opened checkpoint bucket");
        Ok(Self {
            store,
            bucket: bucket.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn load(&self, key: &str) -> Result<Option<StoredCheckpoint>> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| Error::Jetstream(format!("reading checkpoint {key}: {e:?}")))?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        if !matches!(entry.operation, Operation::Put) {
            return Ok(None);
        }
        let sequence = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                Error::Other(format!("checkpoint {key} holds an invalid sequence {:?}", entry.value))
            })?;
        Ok(Some(StoredCheckpoint {
            sequence,
            revision: entry.revision,
        }))
    }

    /// Writes `sequence` under `key` if the stored revision still is `expected_revision`
    /// (`None` meaning the key must not exist yet). Returns the new revision.
    pub async fn commit(
        &self,
        key: &str,
        sequence: u64,
        expected_revision: Option<u64>,
    ) -> Result<u64> {
        let value = Bytes::from(sequence.to_string());
        let written = match expected_revision {
            Some(revision) => self
                .store
                .update(key, value, revision)
                .await
                .map_err(|e| e.to_string()),
            None => self
                .store
                .create(key, value)
                .await
                .map_err(|e| e.to_string()),
        };
        match written {
            Ok(revision) => Ok(revision),
            Err(err) => {
                let actual = self.load(key).await?.map(|c| c.revision);
                if actual != expected_revision {
                    return Err(Error::RevisionConflict {
                        key: key.to_string(),
                        expected: expected_revision,
                        actual,
                    });
                }
                Err(Error::Jetstream(format!("committing checkpoint {key}: {err}")))
            }
        }
    }
}
