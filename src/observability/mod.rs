//! Observability for the functions control plane
//!
//! - `LogSink` is handed to components that log on behalf of a subprocess
//! - `init_tracing` installs the process-wide `tracing` subscriber

mod logger;

pub use logger::{LogRecord, LogSink, MemorySink, Severity, TracingSink};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Calling this twice is harmless;
/// the second install is ignored.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
