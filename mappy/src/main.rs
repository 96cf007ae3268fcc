use std::error::Error;
use std::sync::Arc;

use clap::ArgMatches;
use mappy_core::config::{
    self, CachedResolver, ConfigResolver, EnvResolver, RandomSettings, StoreSettings,
    StreamSettings, SupervisorSettings,
};
use mappy_core::generator::{Generator, PointWriter, StoreWriter, StreamWriter};
use mappy_core::sink::{BroadcastSink, LogSink};
use mappy_core::store::sqlite::SqliteStore;
use mappy_core::{DefaultBackends, PointSink, SourceFactory, Supervisor};
use mappy_jetstream::stream::PartitionedStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cmdline;
mod live;
mod setup_tracing;

const LIVE_FEED_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let resolver: Arc<dyn ConfigResolver> = Arc::new(CachedResolver::new(EnvResolver));
    let cancel = shutdown_on_ctrl_c();

    match matches.subcommand() {
        Some(("serve", args)) => serve(args, resolver, cancel).await,
        Some(("generate", args)) => generate(args, resolver.as_ref(), cancel).await,
        other => Err(format!("unknown command {other:?}").into()),
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(?e, "Listening for Ctrl-C"),
        }
        token.cancel();
    });
    cancel
}

async fn serve(
    args: &ArgMatches,
    resolver: Arc<dyn ConfigResolver>,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let source = match args.get_one::<String>("source") {
        Some(source) => source.clone(),
        None => config::route_point_source(resolver.as_ref())?,
    };
    let supervisor_settings = SupervisorSettings::load(resolver.as_ref())?;

    let sink: Arc<dyn PointSink> = if args.get_flag("log-points") {
        Arc::new(LogSink)
    } else {
        let live = BroadcastSink::new(LIVE_FEED_CAPACITY);
        tokio::spawn(live::forward(
            live.subscribe(),
            std::io::stdout(),
            cancel.clone(),
        ));
        Arc::new(live)
    };

    let factory = SourceFactory::new(resolver, Arc::new(DefaultBackends));
    info!(source, "Starting route point source");
    Supervisor::new(factory, supervisor_settings)
        .run(&source, sink, cancel)
        .await?;
    Ok(())
}

async fn generate(
    args: &ArgMatches,
    resolver: &dyn ConfigResolver,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error>> {
    let settings = RandomSettings::load(resolver)?;
    let writer: Arc<dyn PointWriter> = match args.get_one::<String>("target").map(String::as_str)
    {
        Some("store") => Arc::new(StoreWriter::new(Arc::new(SqliteStore::open(
            &StoreSettings::load(resolver)?,
        )?))),
        _ => {
            let stream_settings = StreamSettings::load(resolver)?;
            let stream = PartitionedStream::connect(stream_settings.stream_config()).await?;
            Arc::new(StreamWriter::new(stream))
        }
    };

    let written = Generator::new(settings, writer, args.get_one::<u64>("count").copied())
        .run(cancel)
        .await?;
    info!(written, "Route points generated");
    Ok(())
}
