//! Configuration is looked up by name through a [`ConfigResolver`] and parsed once into typed
//! settings. Absent optional values fall back to the defaults below; absent mandatory values and
//! unparsable values are [`Error::Config`] errors naming the key.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use mappy_jetstream::stream::PartitionedStreamConfig;
use mappy_jetstream::{ConnectionConfig, NatsAuth};
use parking_lot::RwLock;

use crate::error::{Error, Result};

pub const ENV_ROUTE_POINT_SOURCE: &str = "MAPPY_ROUTE_POINT_SOURCE";

const ENV_STREAM_URL: &str = "MAPPY_STREAM_URL";
const ENV_STREAM_NAME: &str = "MAPPY_STREAM_NAME";
const ENV_STREAM_USER: &str = "MAPPY_STREAM_USER";
const ENV_STREAM_PASSWORD: &str = "MAPPY_STREAM_PASSWORD";
const ENV_STREAM_PARTITIONS: &str = "MAPPY_STREAM_PARTITIONS";
const ENV_CONSUMER_GROUP: &str = "MAPPY_CONSUMER_GROUP";
const ENV_CHECKPOINT_URL: &str = "MAPPY_CHECKPOINT_URL";
const ENV_CHECKPOINT_USER: &str = "MAPPY_CHECKPOINT_USER";
const ENV_CHECKPOINT_PASSWORD: &str = "MAPPY_CHECKPOINT_PASSWORD";
const ENV_CHECKPOINT_BUCKET: &str = "MAPPY_CHECKPOINT_BUCKET";
const ENV_STREAM_BATCH_SIZE: &str = "MAPPY_STREAM_BATCH_SIZE";
const ENV_STREAM_READ_TIMEOUT_MS: &str = "MAPPY_STREAM_READ_TIMEOUT_MS";
const ENV_STORE_PATH: &str = "MAPPY_STORE_PATH";
const ENV_ROUTE_POINTS_TABLE: &str = "MAPPY_ROUTE_POINTS_TABLE";
const ENV_POLL_QUANTUM_SECS: &str = "MAPPY_POLL_QUANTUM_SECS";
const ENV_POLL_INTERVAL_MS: &str = "MAPPY_POLL_INTERVAL_MS";
const ENV_POLL_LOOKBACK_HOURS: &str = "MAPPY_POLL_LOOKBACK_HOURS";
const ENV_POLL_GRACE_SECS: &str = "MAPPY_POLL_GRACE_SECS";
const ENV_RANDOM_SEED: &str = "MAPPY_RANDOM_SEED";
const ENV_RANDOM_DELAY_MS: &str = "MAPPY_RANDOM_DELAY_MS";
const ENV_RANDOM_USERS: &str = "MAPPY_RANDOM_USERS";
const ENV_RANDOM_MAX_RANGE: &str = "MAPPY_RANDOM_MAX_RANGE";
const ENV_MAX_RESTARTS: &str = "MAPPY_MAX_RESTARTS";

/// Supplies named configuration values from an environment specific source.
pub trait ConfigResolver: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvResolver;

impl ConfigResolver for EnvResolver {
    fn get(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

/// Fixed set of values, mostly for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MapResolver {
    values: HashMap<String, String>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapResolver {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl ConfigResolver for MapResolver {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Memoizes lookups of the inner resolver, absent values included. Values are read-mostly and
/// never invalidated for the lifetime of the resolver.
pub struct CachedResolver<R> {
    inner: R,
    cache: RwLock<HashMap<String, Option<String>>>,
}

impl<R: ConfigResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: ConfigResolver> ConfigResolver for CachedResolver<R> {
    fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.cache.read().get(name) {
            return value.clone();
        }
        self.cache
            .write()
            .entry(name.to_string())
            .or_insert_with(|| self.inner.get(name))
            .clone()
    }
}

fn optional(resolver: &dyn ConfigResolver, key: &str) -> Option<String> {
    resolver
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(resolver: &dyn ConfigResolver, key: &str) -> Result<String> {
    optional(resolver, key).ok_or_else(|| Error::Config(format!("{key} is not set")))
}

fn parse_or<T>(resolver: &dyn ConfigResolver, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match optional(resolver, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw:?} is invalid: {e}"))),
    }
}

fn auth(resolver: &dyn ConfigResolver, user_key: &str, password_key: &str) -> Result<Option<NatsAuth>> {
    match (optional(resolver, user_key), optional(resolver, password_key)) {
        (None, None) => Ok(None),
        (Some(username), Some(password)) => Ok(Some(NatsAuth::Basic { username, password })),
        // a password without a user is a token
        (None, Some(token)) => Ok(Some(NatsAuth::Token(token))),
        (Some(_), None) => Err(Error::Config(format!(
            "{user_key} is set but {password_key} is not"
        ))),
    }
}

/// Name of the strategy the host should start.
pub fn route_point_source(resolver: &dyn ConfigResolver) -> Result<String> {
    required(resolver, ENV_ROUTE_POINT_SOURCE)
}

/// Settings of the partitioned event stream and of the checkpoint store next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub connection: ConnectionConfig,
    pub stream: String,
    pub partitions: u16,
    pub consumer_group: String,
    pub checkpoint_connection: ConnectionConfig,
    pub checkpoint_bucket: String,
    pub batch_size: usize,
    pub read_timeout: Duration,
    /// Consecutive failed deliveries of the same batch before the partition gives up.
    pub max_redeliveries: u16,
}

impl StreamSettings {
    const DEFAULT_PARTITIONS: u16 = 4;
    const DEFAULT_CONSUMER_GROUP: &'static str = "default";
    const DEFAULT_CHECKPOINT_BUCKET: &'static str = "mappy-checkpoints";
    const DEFAULT_BATCH_SIZE: usize = 100;
    const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
    const DEFAULT_MAX_REDELIVERIES: u16 = 10;

    pub fn load(resolver: &dyn ConfigResolver) -> Result<Self> {
        let partitions = parse_or(resolver, ENV_STREAM_PARTITIONS, Self::DEFAULT_PARTITIONS)?;
        if partitions == 0 {
            return Err(Error::Config(format!("{ENV_STREAM_PARTITIONS} must be at least 1")));
        }
        let batch_size = parse_or(resolver, ENV_STREAM_BATCH_SIZE, Self::DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(Error::Config(format!("{ENV_STREAM_BATCH_SIZE} must be at least 1")));
        }

        Ok(Self {
            connection: ConnectionConfig {
                addr: required(resolver, ENV_STREAM_URL)?,
                auth: auth(resolver, ENV_STREAM_USER, ENV_STREAM_PASSWORD)?,
            },
            stream: required(resolver, ENV_STREAM_NAME)?,
            partitions,
            consumer_group: optional(resolver, ENV_CONSUMER_GROUP)
                .unwrap_or_else(|| Self::DEFAULT_CONSUMER_GROUP.to_string()),
            checkpoint_connection: ConnectionConfig {
                addr: required(resolver, ENV_CHECKPOINT_URL)?,
                auth: auth(resolver, ENV_CHECKPOINT_USER, ENV_CHECKPOINT_PASSWORD)?,
            },
            checkpoint_bucket: optional(resolver, ENV_CHECKPOINT_BUCKET)
                .unwrap_or_else(|| Self::DEFAULT_CHECKPOINT_BUCKET.to_string()),
            batch_size,
            read_timeout: Duration::from_millis(parse_or(
                resolver,
                ENV_STREAM_READ_TIMEOUT_MS,
                Self::DEFAULT_READ_TIMEOUT_MS,
            )?),
            max_redeliveries: Self::DEFAULT_MAX_REDELIVERIES,
        })
    }

    /// Connection settings of the stream alone, as used by producers and partition readers.
    pub fn stream_config(&self) -> PartitionedStreamConfig {
        PartitionedStreamConfig {
            connection: self.connection.clone(),
            stream: self.stream.clone(),
            partitions: self.partitions,
            batch_size: self.batch_size,
            read_timeout: self.read_timeout,
        }
    }
}

/// Settings of the append-only point store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub path: String,
    pub table: String,
}

impl StoreSettings {
    const DEFAULT_PATH: &'static str = "mappy.db";
    const DEFAULT_TABLE: &'static str = "routepoints";

    pub fn load(resolver: &dyn ConfigResolver) -> Result<Self> {
        let table =
            optional(resolver, ENV_ROUTE_POINTS_TABLE).unwrap_or_else(|| Self::DEFAULT_TABLE.to_string());
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Config(format!(
                "{ENV_ROUTE_POINTS_TABLE}={table:?} may only contain letters, digits and '_'"
            )));
        }
        Ok(Self {
            path: optional(resolver, ENV_STORE_PATH).unwrap_or_else(|| Self::DEFAULT_PATH.to_string()),
            table,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    /// Width of each scanned window, also the amount the watermark advances per cycle.
    pub quantum: TimeDelta,
    /// Delay before each scan.
    pub interval: Duration,
    /// How far behind "now" the watermark starts.
    pub lookback: TimeDelta,
    /// Trailing overlap rescanned on each cycle to catch late writes. Zero disables it.
    pub grace: TimeDelta,
}

impl PollSettings {
    const DEFAULT_QUANTUM_SECS: i64 = 10;
    const DEFAULT_INTERVAL_MS: u64 = 1000;
    const DEFAULT_LOOKBACK_HOURS: i64 = 24;
    const DEFAULT_GRACE_SECS: i64 = 0;
    const MAX_QUANTUM_SECS: i64 = 24 * 60 * 60;
    const MAX_LOOKBACK_HOURS: i64 = 366 * 24;
    const MAX_GRACE_SECS: i64 = 24 * 60 * 60;

    pub fn load(resolver: &dyn ConfigResolver) -> Result<Self> {
        let quantum = bounded_delta(
            resolver,
            ENV_POLL_QUANTUM_SECS,
            Self::DEFAULT_QUANTUM_SECS,
            1..=Self::MAX_QUANTUM_SECS,
            TimeDelta::try_seconds,
        )?;
        let lookback = bounded_delta(
            resolver,
            ENV_POLL_LOOKBACK_HOURS,
            Self::DEFAULT_LOOKBACK_HOURS,
            0..=Self::MAX_LOOKBACK_HOURS,
            TimeDelta::try_hours,
        )?;
        if Utc::now().checked_sub_signed(lookback).is_none() {
            return Err(Error::Config(format!(
                "{ENV_POLL_LOOKBACK_HOURS} reaches before the earliest representable time"
            )));
        }
        let grace = bounded_delta(
            resolver,
            ENV_POLL_GRACE_SECS,
            Self::DEFAULT_GRACE_SECS,
            0..=Self::MAX_GRACE_SECS,
            TimeDelta::try_seconds,
        )?;

        Ok(Self {
            quantum,
            interval: Duration::from_millis(parse_or(
                resolver,
                ENV_POLL_INTERVAL_MS,
                Self::DEFAULT_INTERVAL_MS,
            )?),
            lookback,
            grace,
        })
    }
}

/// Parses an integer count of some time unit and checks it against `range`.
fn bounded_delta(
    resolver: &dyn ConfigResolver,
    name: &str,
    default: i64,
    range: RangeInclusive<i64>,
    to_delta: fn(i64) -> Option<TimeDelta>,
) -> Result<TimeDelta> {
    let value = parse_or(resolver, name, default)?;
    if !range.contains(&value) {
        return Err(Error::Config(format!(
            "{name}={value} is outside {}..={}",
            range.start(),
            range.end()
        )));
    }
    to_delta(value).ok_or_else(|| Error::Config(format!("{name}={value} is out of range")))
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            quantum: TimeDelta::seconds(Self::DEFAULT_QUANTUM_SECS),
            interval: Duration::from_millis(Self::DEFAULT_INTERVAL_MS),
            lookback: TimeDelta::hours(Self::DEFAULT_LOOKBACK_HOURS),
            grace: TimeDelta::seconds(Self::DEFAULT_GRACE_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RandomSettings {
    pub seed: u64,
    pub delay: Duration,
    pub users: u32,
    pub max_range: f64,
}

impl RandomSettings {
    const DEFAULT_SEED: u64 = 17;
    const DEFAULT_DELAY_MS: u64 = 250;
    const DEFAULT_USERS: u32 = 10;
    const DEFAULT_MAX_RANGE: f64 = 0.5;

    pub fn load(resolver: &dyn ConfigResolver) -> Result<Self> {
        Ok(Self {
            seed: parse_or(resolver, ENV_RANDOM_SEED, Self::DEFAULT_SEED)?,
            delay: Duration::from_millis(parse_or(
                resolver,
                ENV_RANDOM_DELAY_MS,
                Self::DEFAULT_DELAY_MS,
            )?),
            users: parse_or(resolver, ENV_RANDOM_USERS, Self::DEFAULT_USERS)?,
            max_range: parse_or(resolver, ENV_RANDOM_MAX_RANGE, Self::DEFAULT_MAX_RANGE)?,
        })
    }
}

impl Default for RandomSettings {
    fn default() -> Self {
        Self {
            seed: Self::DEFAULT_SEED,
            delay: Duration::from_millis(Self::DEFAULT_DELAY_MS),
            users: Self::DEFAULT_USERS,
            max_range: Self::DEFAULT_MAX_RANGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Consecutive failed runs restarted before the error is handed to the host.
    pub max_restarts: u16,
    pub restart_base_delay: Duration,
    pub restart_max_delay: Duration,
    /// A run lasting at least this long counts as healthy and resets the restart budget.
    pub healthy_after: Duration,
}

impl SupervisorSettings {
    const DEFAULT_MAX_RESTARTS: u16 = 5;

    pub fn load(resolver: &dyn ConfigResolver) -> Result<Self> {
        Ok(Self {
            max_restarts: parse_or(resolver, ENV_MAX_RESTARTS, Self::DEFAULT_MAX_RESTARTS)?,
            ..Default::default()
        })
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: Self::DEFAULT_MAX_RESTARTS,
            restart_base_delay: Duration::from_millis(500),
            restart_max_delay: Duration::from_secs(30),
            healthy_after: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn stream_resolver() -> MapResolver {
        MapResolver::new()
            .with(ENV_STREAM_URL, "nats://stream:4222")
            .with(ENV_STREAM_NAME, "routepoints")
            .with(ENV_CHECKPOINT_URL, "nats://checkpoints:4222")
    }

    #[test]
    fn stream_settings_defaults() {
        let settings = StreamSettings::load(&stream_resolver()).unwrap();
        assert_eq!(settings.connection.addr, "nats://stream:4222");
        assert_eq!(settings.connection.auth, None);
        assert_eq!(settings.stream, "routepoints");
        assert_eq!(settings.partitions, 4);
        assert_eq!(settings.consumer_group, "default");
        assert_eq!(settings.checkpoint_connection.addr, "nats://checkpoints:4222");
        assert_eq!(settings.checkpoint_bucket, "mappy-checkpoints");
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.read_timeout, Duration::from_secs(1));
    }

    #[test]
    fn stream_settings_require_connection_names() {
        for missing in [ENV_STREAM_URL, ENV_STREAM_NAME, ENV_CHECKPOINT_URL] {
            let resolver: MapResolver = [
                (ENV_STREAM_URL, "nats://stream:4222"),
                (ENV_STREAM_NAME, "routepoints"),
                (ENV_CHECKPOINT_URL, "nats://checkpoints:4222"),
            ]
            .into_iter()
            .filter(|(key, _)| *key != missing)
            .collect();
            match StreamSettings::load(&resolver) {
                Err(Error::Config(msg)) => assert!(msg.contains(missing), "{msg}"),
                other => panic!("expected config error for {missing}, got {other:?}"),
            }
        }
    }

    #[test]
    fn stream_credentials() {
        let resolver = stream_resolver()
            .with(ENV_STREAM_USER, "reader")
            .with(ENV_STREAM_PASSWORD, "secret")
            .with(ENV_CHECKPOINT_PASSWORD, "token");
        let settings = StreamSettings::load(&resolver).unwrap();
        assert_eq!(
            settings.connection.auth,
            Some(NatsAuth::Basic {
                username: "reader".into(),
                password: "secret".into()
            })
        );
        assert_eq!(
            settings.checkpoint_connection.auth,
            Some(NatsAuth::Token("token".into()))
        );

        let resolver = stream_resolver().with(ENV_CHECKPOINT_USER, "writer");
        assert!(matches!(StreamSettings::load(&resolver), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_values_name_the_key() {
        let resolver = stream_resolver().with(ENV_STREAM_PARTITIONS, "many");
        match StreamSettings::load(&resolver) {
            Err(Error::Config(msg)) => assert!(msg.contains(ENV_STREAM_PARTITIONS)),
            other => panic!("unexpected {other:?}"),
        }

        let resolver = MapResolver::new().with(ENV_POLL_QUANTUM_SECS, "0");
        assert!(matches!(PollSettings::load(&resolver), Err(Error::Config(_))));

        let resolver = MapResolver::new().with(ENV_ROUTE_POINTS_TABLE, "points; drop");
        assert!(matches!(StoreSettings::load(&resolver), Err(Error::Config(_))));
    }

    #[test]
    fn poll_durations_out_of_range() {
        for (key, value) in [
            (ENV_POLL_QUANTUM_SECS, "9223372036854775807"),
            (ENV_POLL_QUANTUM_SECS, "100000000000"),
            (ENV_POLL_QUANTUM_SECS, "-5"),
            (ENV_POLL_LOOKBACK_HOURS, "100000000000"),
            (ENV_POLL_LOOKBACK_HOURS, "-1"),
            (ENV_POLL_GRACE_SECS, "9223372036854775807"),
        ] {
            match PollSettings::load(&MapResolver::new().with(key, value)) {
                Err(Error::Config(msg)) => assert!(msg.contains(key), "{msg}"),
                other => panic!("{key}={value}: unexpected {other:?}"),
            }
        }

        let widest = MapResolver::new()
            .with(ENV_POLL_QUANTUM_SECS, "86400")
            .with(ENV_POLL_LOOKBACK_HOURS, "8784")
            .with(ENV_POLL_GRACE_SECS, "86400");
        let settings = PollSettings::load(&widest).unwrap();
        assert_eq!(settings.quantum, TimeDelta::days(1));
        assert_eq!(settings.lookback, TimeDelta::days(366));
    }

    #[test]
    fn optional_settings_defaults() {
        let empty = MapResolver::new();
        assert_eq!(PollSettings::load(&empty).unwrap(), PollSettings::default());
        assert_eq!(RandomSettings::load(&empty).unwrap(), RandomSettings::default());
        assert_eq!(
            SupervisorSettings::load(&empty).unwrap(),
            SupervisorSettings::default()
        );
        let store = StoreSettings::load(&empty).unwrap();
        assert_eq!(store.path, "mappy.db");
        assert_eq!(store.table, "routepoints");
        assert!(matches!(route_point_source(&empty), Err(Error::Config(_))));

        let random = RandomSettings::load(&MapResolver::new().with(ENV_RANDOM_SEED, " 42 ")).unwrap();
        assert_eq!(random.seed, 42);
    }

    struct CountingResolver {
        lookups: AtomicUsize,
    }

    impl ConfigResolver for CountingResolver {
        fn get(&self, name: &str) -> Option<String> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            (name == "PRESENT").then(|| "value".to_string())
        }
    }

    #[test]
    fn cached_resolver_consults_inner_once_per_name() {
        let cached = CachedResolver::new(CountingResolver {
            lookups: AtomicUsize::new(0),
        });
        for _ in 0..3 {
            assert_eq!(cached.get("PRESENT").as_deref(), Some("value"));
            assert_eq!(cached.get("ABSENT"), None);
        }
        assert_eq!(cached.inner.lookups.load(Ordering::SeqCst), 2);
    }
}
