//! Logging setup for the conductor binary.
//!
//! Log levels follow `tracing`:
//! - ERROR: failures that stop an operation (a task failing, the log not writable)
//! - WARN: recoverable surprises (discarded tool calls, stale worker replies)
//! - INFO: lifecycle (startup, task created/completed, holds, shutdown)
//! - DEBUG: every event and transition
//!
//! Debug mode can be enabled with `--debug` or `CONDUCTOR_DEBUG=1`.
//! `CONDUCTOR_LOG` takes an `EnvFilter` directive and overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "CONDUCTOR_LOG";
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Check if debug mode is requested by flag or environment.
pub fn debug_requested(flag: bool) -> bool {
    flag || std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Build the filter: `CONDUCTOR_LOG` if set, otherwise `info` or `debug`.
pub fn filter(debug: bool) -> EnvFilter {
    let fallback = if debug { "debug" } else { "info" };
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Path of the log file, `~/.conductor/conductor.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".conductor").join("conductor.log"))
}

/// Install the global subscriber.
///
/// Writes to the log file (truncated on startup) when a home directory is
/// available, otherwise to stderr. Calling this twice is harmless.
pub fn init(debug: bool) {
    let debug = debug_requested(debug);
    let file = log_path().and_then(|path| {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok()?;
        }
        File::create(&path).ok()
    });

    let result = match file {
        Some(file) => tracing_subscriber::registry()
            .with(filter(debug))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init(),
        None => tracing_subscriber::registry()
            .with(filter(debug))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if result.is_ok() {
        let enabled = debug;
        tracing::debug!(enabled, "logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_flag_wins() {
        assert!(debug_requested(true));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(true);
        init(false);
        tracing::debug!("still logging");
    }

    #[test]
    fn test_log_path_under_conductor_dir() {
        if let Some(path) = log_path() {
            assert!(path.ends_with(".conductor/conductor.log"));
        }
    }
}
