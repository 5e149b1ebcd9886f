//! Logging module for tether.
//!
//! Structured logging built on `tracing`. Components that still log through
//! the `log` crate are bridged into the same subscriber.

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Whether to log to stderr (default: true)
    pub log_to_stderr: bool,

    /// Whether to log to a file (default: false)
    pub log_to_file: bool,

    /// Directory to store log files (default: "./logs")
    pub log_dir: String,

    /// Base filename for log files (default: "tether")
    pub log_file_name: String,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: true)
    pub include_file_line: bool,

    /// Whether to log span open/close events (default: false)
    pub include_span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_to_stderr: true,
            log_to_file: false,
            log_dir: "./logs".to_string(),
            log_file_name: "tether".to_string(),
            json_format: false,
            include_file_line: true,
            include_span_events: false,
        }
    }
}

/// Parse a level name as used in config files and on the command line.
/// Unknown names fall back to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure file logs are flushed.
///
/// # Examples
///
/// ```
/// use shared_utils::logging::{init_logging, LogOptions};
/// use tracing::Level;
///
/// let options = LogOptions {
///     level: Level::DEBUG,
///     ..Default::default()
/// };
///
/// let _guard = init_logging(options);
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Bridge `log` records into `tracing`
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());
    let span_events = if options.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let mut layers = Vec::new();
    let mut guard = None;

    if options.log_to_stderr {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_span_events(span_events.clone())
            .with_target(true);

        let stderr_layer = if options.json_format {
            stderr_layer.json().boxed()
        } else {
            stderr_layer.boxed()
        };

        layers.push(stderr_layer);
    }

    if options.log_to_file {
        let file_appender =
            RollingFileAppender::new(Rotation::DAILY, &options.log_dir, &options.log_file_name);

        let (non_blocking, worker_guard) = NonBlocking::new(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_file(options.include_file_line)
            .with_line_number(options.include_file_line)
            .with_span_events(span_events)
            .with_target(true)
            .with_ansi(false)
            .with_writer(non_blocking);

        let file_layer = if options.json_format {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        };

        layers.push(file_layer);
    }

    // Ignore if a subscriber is already set in this process
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Initialize logging from a configuration.
///
/// # Examples
///
/// ```
/// use shared_utils::logging::init_logging_from_config;
/// use shared_utils::config::Config;
///
/// let config = Config::default();
/// let _guard = init_logging_from_config(&config, "tether-doc");
/// ```
pub fn init_logging_from_config(
    config: &crate::config::Config,
    log_file_name: &str,
) -> Option<WorkerGuard> {
    let options = LogOptions {
        level: parse_level(&config.log_level),
        log_to_file: config.logging.log_to_file,
        log_dir: config.logging.log_dir.clone(),
        log_file_name: log_file_name.to_string(),
        json_format: config.logging.json_format,
        ..Default::default()
    };

    init_logging(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tracing::{debug, error, info, trace, warn};

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn test_init_logging() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().to_str().unwrap().to_string();

        let options = LogOptions {
            level: Level::TRACE,
            log_to_stderr: false,
            log_to_file: true,
            log_dir,
            log_file_name: "test.log".to_string(),
            ..Default::default()
        };

        let guard = init_logging(options);
        assert!(guard.is_some());

        trace!("This is a trace message");
        debug!("This is a debug message");
        info!("This is an info message");
        warn!("This is a warning message");
        error!("This is an error message");

        // The rolling appender creates its file eagerly
        let entries = fs::read_dir(dir.path()).unwrap();
        assert!(entries.count() > 0);
    }
}
