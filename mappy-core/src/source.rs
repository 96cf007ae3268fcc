use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigResolver, PollSettings, RandomSettings, StoreSettings, StreamSettings};
use crate::error::{Error, Result};
use crate::sink::PointSink;
use crate::source::poll::WindowedPollSource;
use crate::source::random::RandomWalkSource;
use crate::source::stream::{StreamBackend, StreamCheckpointSource};
use crate::store::RoutePointStore;
use crate::store::sqlite::SqliteStore;

/// Synthetic random walk over simulated users.
pub mod random;

/// Time windowed polling of the point store.
pub mod poll;

/// Durable event stream with partition checkpoints.
pub mod stream;

/// The closed set of ingestion strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    EventHub,
    Random,
    TableStorage,
}

impl FromStr for SourceKind {
    type Err = Error;

    /// Case-insensitive. Surrounding whitespace is not stripped.
    fn from_str(name: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::InvalidSource(
                "route point source name is empty".to_string(),
            ));
        }
        match name.to_lowercase().as_str() {
            "eventhub" => Ok(SourceKind::EventHub),
            "random" => Ok(SourceKind::Random),
            "tablestorage" => Ok(SourceKind::TableStorage),
            _ => Err(Error::InvalidSource(format!(
                "unknown route point source {name:?}"
            ))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::EventHub => write!(f, "eventhub"),
            SourceKind::Random => write!(f, "random"),
            SourceKind::TableStorage => write!(f, "tablestorage"),
        }
    }
}

/// Hands out the external resources a source needs. Only called once the strategy name has
/// been validated.
#[async_trait]
pub trait Backends: Send + Sync {
    async fn event_stream(&self, settings: &StreamSettings) -> Result<StreamBackend>;

    async fn route_store(&self, settings: &StoreSettings) -> Result<Arc<dyn RoutePointStore>>;
}

/// NATS JetStream for the event stream, SQLite for the point store.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackends;

#[async_trait]
impl Backends for DefaultBackends {
    async fn event_stream(&self, settings: &StreamSettings) -> Result<StreamBackend> {
        stream::jetstream::connect(settings).await
    }

    async fn route_store(&self, settings: &StoreSettings) -> Result<Arc<dyn RoutePointStore>> {
        Ok(Arc::new(SqliteStore::open(settings)?))
    }
}

/// A started source.
pub struct RunningSource {
    pub kind: SourceKind,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl RunningSource {
    /// Asks the source to stop; [`RunningSource::wait`] returns once it has.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the source task and reports how it ended.
    pub async fn wait(self) -> Result<()> {
        self.handle.await?
    }
}

/// Selects and starts exactly one source by name.
#[derive(Clone)]
pub struct SourceFactory {
    resolver: Arc<dyn ConfigResolver>,
    backends: Arc<dyn Backends>,
}

impl SourceFactory {
    pub fn new(resolver: Arc<dyn ConfigResolver>, backends: Arc<dyn Backends>) -> Self {
        Self { resolver, backends }
    }

    /// Starts the source called `name`, wired to `sink`. Resolves once the source has been
    /// initiated: stream sources once every partition is attached, the others once their task
    /// is running. The source stops when `cancel` fires.
    pub async fn start(
        &self,
        name: &str,
        sink: Arc<dyn PointSink>,
        cancel: CancellationToken,
    ) -> Result<RunningSource> {
        let kind: SourceKind = name.parse()?;
        let resolver = self.resolver.as_ref();

        let handle = match kind {
            SourceKind::EventHub => {
                let settings = StreamSettings::load(resolver)?;
                info!(
                    stream = settings.stream,
                    consumer_group = settings.consumer_group,
                    "Attaching to event stream"
                );
                let backend = self.backends.event_stream(&settings).await?;
                StreamCheckpointSource::new(backend, sink, settings.max_redeliveries)
                    .start(cancel.clone())
                    .await?
            }
            SourceKind::Random => {
                let source = RandomWalkSource::new(&RandomSettings::load(resolver)?, sink)?;
                tokio::spawn(source.run(cancel.clone()))
            }
            SourceKind::TableStorage => {
                let poll = PollSettings::load(resolver)?;
                let store = self.backends.route_store(&StoreSettings::load(resolver)?).await?;
                let source = WindowedPollSource::new(poll, store, sink);
                tokio::spawn(source.run(cancel.clone()))
            }
        };
        info!(%kind, "Route point source started");

        Ok(RunningSource {
            kind,
            cancel,
            handle,
        })
    }
}
