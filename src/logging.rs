use crate::error::AppError;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "OEJP_METER_LOG";
pub const LOG_FILE: &str = "oejp-meter.log";

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Logs to stderr; stdout stays reserved for command output.
pub fn init_stderr(default_level: &str) {
    let _ = fmt()
        .with_env_filter(filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Logs to a file under `dir` so a full-screen terminal UI stays clean.
///
/// The returned guard flushes pending lines when dropped.
pub fn init_file(dir: &Path, default_level: &str) -> Result<WorkerGuard, AppError> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = fmt()
        .with_env_filter(filter(default_level))
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(guard)
}
