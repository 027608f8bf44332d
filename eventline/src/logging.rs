//! Logging setup for hosts and the CLI.
//!
//! Installs a `tracing` subscriber with a stderr layer and, when a directory
//! is configured, a daily-rolling file layer written from a background thread.
//! `EVENTLINE_LOG` overrides the configured filter, e.g.
//! `EVENTLINE_LOG=eventline::transport=debug,info`.

use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{PipelineError, PipelineResult};

/// Environment variable that overrides [`LoggingConfig::level`].
pub const LOG_ENV_VAR: &str = "EVENTLINE_LOG";

/// Default filter directive.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default prefix of rolled log files.
pub const DEFAULT_LOG_FILE_PREFIX: &str = "eventline.log";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `eventline=debug,warn`.
    pub level: String,
    /// Directory for rolled log files. `None` logs to stderr only.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            directory: None,
            file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
        }
    }
}

/// Keeps the file writer alive. Dropping it flushes buffered lines.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// # Errors
///
/// `Config` if the filter does not parse, the log directory cannot be
/// created, or a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> PipelineResult<LoggingGuard> {
    let filter = build_filter(config)?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTime::new(Rfc3339))
        .with_target(true);

    let (file_layer, file_guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                PipelineError::Config(format!(
                    "cannot create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::new(Rfc3339))
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PipelineError::Config(format!("logging already initialised: {}", e)))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn build_filter(config: &LoggingConfig) -> PipelineResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV_VAR) {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| {
        PipelineError::Config(format!("invalid log level '{}': {}", config.level, e))
    })
}
