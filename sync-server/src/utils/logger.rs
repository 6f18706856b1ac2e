//! Logging Infrastructure
//!
//! Structured logging via `tracing`. Console output by default, daily rolling
//! file when a log directory is given, JSON when requested. `RUST_LOG`
//! overrides the configured level.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

const LOG_FILE_PREFIX: &str = "sync-server.log";

/// Initialize the logger with defaults (info, plain text, stdout)
pub fn init_logger() {
    init_logger_with_file(None, false, None);
}

/// Initialize the logger with optional file output
///
/// Keep the returned guard alive for the lifetime of the process; dropping it
/// flushes and stops the background file writer.
pub fn init_logger_with_file(
    log_level: Option<&str>,
    json: bool,
    log_dir: Option<&Path>,
) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.unwrap_or("info")));

    let (writer, guard) = match log_dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (BoxMakeWriter::new(writer), Some(guard))
            }
            Err(e) => {
                eprintln!("Cannot create log dir {}: {e}, logging to stdout", dir.display());
                (BoxMakeWriter::new(std::io::stdout), None)
            }
        },
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Logger already initialized: {e}");
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init_logger_with_file(Some("debug"), true, Some(dir.path()));
        assert!(guard.is_some());
        tracing::info!("logger smoke test");
        drop(guard);
    }
}
