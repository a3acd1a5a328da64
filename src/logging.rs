//! Logging setup
//!
//! Builds the process-wide tracing subscriber once at startup. The event
//! loop itself only ever logs inside the span it is handed.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(level: &str) -> String {
    format!("{}={}", env!("CARGO_PKG_NAME").replace('-', "_"), level)
}

/// Install the global subscriber
///
/// Logs go to `log_file` (appended, no ANSI colours) when given, stdout
/// otherwise. `RUST_LOG` overrides `default_level`, e.g.
/// `RUST_LOG=presence_chat=trace`.
pub fn init(
    default_level: &str,
    log_file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(default_level)))?;

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    }
}
