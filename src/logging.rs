//! Logging setup for binaries embedding the backend.
//!
//! The backend itself only emits `tracing` events. `init` routes them to
//! systemd's journal on Linux, or to a daily rolling file elsewhere and when
//! journald is unavailable.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "CLEPHO_DB_LOG";

/// Where `init` sent the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Journald,
    File(PathBuf),
}

/// Keeps the file writer thread alive for the rest of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// `CLEPHO_DB_LOG` if set and valid, `info` otherwise.
///
/// `debug` shows every lock retry; `warn` keeps only exhausted retries,
/// escalations and stuck transactions.
fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clepho")
        .join("logs")
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(log_dir: Option<PathBuf>) -> Result<LogTarget> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter())
                .with(journald)
                .try_init()?;
            tracing::info!("Database logging to journald");
            return Ok(LogTarget::Journald);
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "dbengine.log"));
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;

    tracing::info!("Database logging to {:?}", log_dir);
    Ok(LogTarget::File(log_dir))
}
