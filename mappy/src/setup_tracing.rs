use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const ENV_DEBUG: &str = "MAPPY_DEBUG";
const ENV_RUST_LOG: &str = "RUST_LOG";

const DEFAULT_DIRECTIVES: &str = "info";
// the NATS client is chatty at debug
const DEBUG_DIRECTIVES: &str = "debug,async_nats=info";

/// How the process logs, read from the environment once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogSettings {
    /// Human readable output and debug level. JSON lines otherwise.
    debug: bool,
    /// Explicit `RUST_LOG` directives, which win over the defaults.
    directives: Option<String>,
}

impl LogSettings {
    fn from_env() -> Self {
        Self {
            debug: std::env::var(ENV_DEBUG).is_ok_and(|v| v.trim().eq_ignore_ascii_case("true")),
            directives: std::env::var(ENV_RUST_LOG)
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    fn filter(&self) -> EnvFilter {
        let directives = self.directives.as_deref().unwrap_or(if self.debug {
            DEBUG_DIRECTIVES
        } else {
            DEFAULT_DIRECTIVES
        });
        EnvFilter::builder().parse_lossy(directives)
    }
}

/// Installs the global subscriber and the panic hook. Logs go to stderr since stdout carries the
/// live point feed.
pub fn register() {
    let settings = LogSettings::from_env();

    let layer = if settings.debug {
        fmt::layer().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(settings.filter())
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(log_panic));
}

/// Routes panics into the log stream as one structured event.
fn log_panic(info: &PanicHookInfo<'_>) {
    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>");
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_default();

    // only captured when RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!(%location, %backtrace, "Panicked: {payload}");
    } else {
        tracing::error!(%location, "Panicked: {payload}");
    }
}
