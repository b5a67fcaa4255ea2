//! Structured logging for the share and hub processes.
//!
//! Everything logs through `tracing`. Human readable output goes to stderr at
//! the configured verbosity; an optional log file always receives debug output,
//! either as plain text or as one JSON object per line.

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only
    Quiet,
    /// Info level
    #[default]
    Normal,
    /// Debug level
    Verbose,
    /// Trace level
    Trace,
}

impl Verbosity {
    /// Map the debug toggle onto a verbosity.
    pub fn from_debug(debug: bool) -> Self {
        if debug {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    pub fn as_level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }

    pub fn as_level(&self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
            Verbosity::Trace => Level::TRACE,
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level for stderr output.
    pub verbosity: Verbosity,
    /// Optional path to log file.
    pub log_file: Option<PathBuf>,
    /// Write the log file as JSON lines.
    pub json_file: bool,
}

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping it flushes pending file output.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured verbosity.
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.verbosity.as_level_filter().into())
        .from_env_lossy();

    let (file_layer, file_guard) = match config.log_file {
        Some(ref log_file) => {
            let (directory, filename) = split_log_path(log_file);
            let file_appender = tracing_appender::rolling::never(directory, filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(non_blocking);
            let layer = if config.json_file {
                layer.json().with_filter(LevelFilter::DEBUG).boxed()
            } else {
                layer
                    .with_timer(fmt::time::uptime())
                    .with_filter(LevelFilter::DEBUG)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = fmt::layer()
        .with_ansi(true)
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .with_writer(std::io::stderr)
        .with_filter(config.verbosity.as_level_filter());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}

fn split_log_path(path: &Path) -> (PathBuf, String) {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("kbucket.log")
        .to_string();
    (directory, filename)
}
