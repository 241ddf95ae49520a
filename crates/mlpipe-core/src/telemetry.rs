//! Tracing setup for the mlpipe binary.
//!
//! Logs never go to stdout: stdout carries the stage results and metrics the
//! operator reads, so the default sink is stderr.

use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose events pass the default filter.
const LOG_TARGETS: [&str; 2] = ["mlpipe_core", "mlpipe"];

/// Filter used when `RUST_LOG` is unset: `level` for our crates only, so
/// dependency chatter stays out of the operator's terminal.
pub fn default_filter(level: Level) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={}", level.as_str().to_ascii_lowercase()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber writing to stderr. Later calls are no-ops.
pub fn init_tracing(json: bool, level: Level) {
    init_tracing_with_writer(json, level, std::io::stderr);
}

/// Install the global subscriber writing to `writer`.
///
/// `json` switches to newline-delimited JSON lines, one object per event.
pub fn init_tracing_with_writer<W>(json: bool, level: Level, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let layer = fmt::layer().with_target(false).with_writer(writer);

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
