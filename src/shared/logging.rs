use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the background log writers alive. Drop it only at shutdown, or
/// buffered lines are lost.
#[must_use = "dropping the guard stops log output"]
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    // RUST_LOG overrides the default level.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Logs to `<log_dir>/<service_name>.log`, rotated daily, and to stderr.
/// Any log left by a previous run is moved aside first.
pub fn init_logging(log_dir: &Path, service_name: &str) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let backup = rotate_logs_on_startup(log_dir, service_name)?;

    let file_appender = rolling::daily(log_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = non_blocking(file_appender);
    // Keep stdout free for the relayed process output.
    let (console_writer, console_guard) = non_blocking(std::io::stderr());

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(console_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(backup) = backup {
        info!("Previous log file backed up to: {}", backup.display());
    }
    info!(
        "Logging initialized - logs will be written to {}/{service_name}.log",
        log_dir.display()
    );

    Ok(LoggingGuard {
        _guards: vec![file_guard, console_guard],
    })
}

/// Console-only logging for embedders that have no log directory.
pub fn init_console_logging() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .context("Failed to install tracing subscriber")
}

/// Moves an existing `<service_name>.log` to a timestamped name and returns
/// where it went.
pub fn rotate_logs_on_startup(log_dir: &Path, service_name: &str) -> anyhow::Result<Option<PathBuf>> {
    let log_path = log_dir.join(format!("{service_name}.log"));
    if !log_path.exists() {
        return Ok(None);
    }

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let backup = log_dir.join(format!("{service_name}.{timestamp}.log"));
    std::fs::rename(&log_path, &backup)
        .with_context(|| format!("Failed to back up {}", log_path.display()))?;
    Ok(Some(backup))
}
