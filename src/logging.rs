//! Diagnostic logging for the scheduler and its runners.
//!
//! Records go to the systemd journal under the `swapflow` identifier when
//! one is reachable, else to `swapflow.log` rotated daily. What the operator
//! sees during a run is the separate `RunEvent::Log` stream.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FILTER_ENV: &str = "SWAPFLOW_LOG";
const LOG_FILE: &str = "swapflow.log";

/// Keeps the file writer thread alive for the life of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swapflow")
        .join("logs")
}

#[cfg(target_os = "linux")]
fn init_journald() -> bool {
    let Ok(layer) = tracing_journald::layer() else {
        return false;
    };
    let installed = tracing_subscriber::registry()
        .with(filter())
        .with(layer.with_syslog_identifier("swapflow".to_string()))
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(backend = "journald", "Diagnostics enabled");
    }
    installed
}

#[cfg(not(target_os = "linux"))]
fn init_journald() -> bool {
    false
}

/// Install the global subscriber. `SWAPFLOW_LOG` takes an `EnvFilter`
/// directive such as `debug` or `swapflow::tasks=trace`; the default is `info`.
///
/// `log_dir` is only used when the journal is unavailable.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    if init_journald() {
        return Ok(());
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE));
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter())
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    tracing::info!(backend = "file", dir = %log_dir.display(), "Diagnostics enabled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir_is_per_application() {
        assert!(default_log_dir().ends_with("swapflow/logs"));
    }
}
