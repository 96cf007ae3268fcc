//! NATS JetStream plumbing for the route point event stream.
//!
//! A partitioned stream `S` with `n` partitions is a single JetStream stream bound to the
//! subjects `S.0` .. `S.(n-1)`. Producers pick the partition from the message key, consumers
//! read one partition subject each. Consumer checkpoints live in a separate key-value bucket,
//! which may sit on a different NATS account or server than the stream.

use std::time::Duration;

use async_nats::ConnectOptions;
use async_nats::jetstream::Context;

pub mod checkpoint;
pub mod stream;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to NATS {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Jetstream - {0}")]
    Jetstream(String),

    #[error("Checkpoint {key} was moved by another owner (expected revision {expected:?}, found {actual:?})")]
    RevisionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("{0}")]
    Other(String),
}

/// Represents the authentication method used to connect to NATS.
#[derive(Clone, PartialEq)]
pub enum NatsAuth {
    Basic { username: String, password: String },
    Token(String),
}

impl std::fmt::Debug for NatsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatsAuth::Basic { username, .. } => write!(f, "Basic({username}:****)"),
            NatsAuth::Token(_) => write!(f, "Token(****)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub addr: String,
    pub auth: Option<NatsAuth>,
}

/// Opens a JetStream context on the given server.
pub async fn connect(config: &ConnectionConfig) -> Result<Context> {
    let mut conn_opts = ConnectOptions::new()
        .max_reconnects(None) // unlimited reconnects
        .reconnect_delay_callback(|attempts| {
            Duration::from_millis(std::cmp::min((attempts * 10) as u64, 1000))
        })
        .ping_interval(Duration::from_secs(3));
    if let Some(auth) = config.auth.clone() {
        conn_opts = match auth {
            NatsAuth::Basic { username, password } => {
                conn_opts.user_and_password(username, password)
            }
            NatsAuth::Token(token) => conn_opts.token(token),
        };
    }

    let client = async_nats::connect_with_options(&config.addr, conn_opts)
        .await
        .map_err(|err| Error::Connection {
            server: config.addr.clone(),
            error: err.to_string(),
        })?;
    tracing::info!(addr = config.addr, "Connected to NATS");
    Ok(async_nats::jetstream::new(client))
}

/// Subject carrying partition `partition` of `stream`.
pub fn partition_subject(stream: &str, partition: u16) -> String {
    format!("{stream}.{partition}")
}

/// Maps a message key onto a partition. The mapping only depends on the key bytes (FNV-1a), so
/// every producer agrees on it across processes and releases.
pub fn partition_for_key(key: &str, partitions: u16) -> u16 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    if partitions <= 1 {
        return 0;
    }
    let hash = key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    });
    (hash % u64::from(partitions)) as u16
}
