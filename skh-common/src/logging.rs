//! Process-level tracing setup for harness binaries.
//!
//! Library code only emits `tracing` events; binaries call [`init_logging`]
//! once at startup and hold the returned guards until exit.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::config::EnvParser;

/// Output format for the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub to_stderr: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Build from `SKH_LOG_LEVEL`, falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level);
        Self {
            level,
            format: LogFormat::Pretty,
            to_stderr: false,
            file: None,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.to_stderr = true;
        self
    }

    pub fn with_json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(format!(
            "skh_common={level},skh_e2e={level}",
            level = self.level
        ))
        .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Guards that flush buffered log writers on drop.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> std::io::Result<LoggingGuards> {
    let mut guards = LoggingGuards::default();

    let file_layer = match config.file.as_ref() {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&dir)?;
            let file_name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "skh-e2e.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards._file = Some(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let (pretty_layer, json_layer) = match config.format {
        LogFormat::Pretty => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .compact(),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    let (pretty_layer, json_layer) = if config.to_stderr {
        (pretty_layer, json_layer)
    } else {
        (None, None)
    };

    let subscriber = tracing_subscriber::registry()
        .with(config.filter())
        .with(file_layer)
        .with(pretty_layer)
        .with(json_layer);

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(guards)
}
