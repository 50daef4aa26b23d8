//! Logging setup and small async helpers.

use std::path::Path;

use berth_shared::errors::{BerthError, BerthResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::runtime::constants::filenames;

/// Flushes the file log when dropped.
pub type LogGuard = WorkerGuard;

/// Install the global subscriber: a daily-rotated file log under `logs_dir`
/// plus human-readable output on stderr.
///
/// `level` overrides `RUST_LOG`; both fall back to "info". The returned guard
/// must be held until exit so buffered file logs are flushed.
pub fn init_logging(logs_dir: &Path, level: Option<&str>) -> BerthResult<LogGuard> {
    std::fs::create_dir_all(logs_dir)
        .map_err(|e| BerthError::Storage(format!("failed to create logs directory: {e}")))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, filenames::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    register_to_tracing(non_blocking, env_filter(level)?);

    Ok(guard)
}

fn env_filter(level: Option<&str>) -> BerthResult<EnvFilter> {
    match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|e| BerthError::Config(format!("invalid log level '{level}': {e}"))),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .map_err(|e| BerthError::Config(format!("invalid log filter: {e}"))),
    }
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}

/// Run filesystem-heavy work off the async executor.
pub async fn run_blocking<T, F>(f: F) -> BerthResult<T>
where
    F: FnOnce() -> BerthResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BerthError::Internal(format!("blocking task failed: {e}")))?
}
