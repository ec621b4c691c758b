//! Subscriber setup for the binaries

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, TftpError};

/// Install the global subscriber.
///
/// Console output goes to stderr so a download to stdout stays clean.
/// With a log file configured, output goes through a non-blocking writer;
/// keep the returned guard alive until exit or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| TftpError::Config(format!("Invalid log level '{}': {}", config.level, e)))?;

    let Some(log_file) = config.file.as_ref() else {
        let result = match config.format {
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init(),
        };
        result.map_err(|e| TftpError::Config(format!("Failed to install logger: {}", e)))?;
        return Ok(None);
    };

    let dir = match log_file.parent() {
        Some(path) if !path.as_os_str().is_empty() => path,
        _ => std::path::Path::new("."),
    };
    let file_name = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TftpError::Config("logging.file must include a file name".to_string()))?;
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(non_blocking)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .try_init(),
    };
    result.map_err(|e| TftpError::Config(format!("Failed to install logger: {}", e)))?;

    Ok(Some(guard))
}
