use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// What log levels are supported?
/// Higher-value variants are more severe.
#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// `EnvFilter` directive for this level. `tracing` has nothing above error.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: LogLevel,
    pub format: LogFormat,
    /// When set, a daily rolling copy of the log is written here as well.
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level,
            format: LogFormat::Text,
            log_dir,
            file_name: "cdplug.log".to_string(),
        }
    }

    pub fn json(mut self) -> Self {
        self.format = LogFormat::Json;
        self
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// `RUST_LOG` wins over the configured level when it is set.
    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if !directives.trim().is_empty() => {
                EnvFilter::try_new(&directives).with_context(|| format!("invalid RUST_LOG `{directives}`"))
            }
            _ => Ok(EnvFilter::new(self.log_level.directive())),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(LogLevel::Info, None)
    }
}

/// Installs the global subscriber: stderr in the configured format plus an
/// optional plain-text daily file.
///
/// Stdout is left alone; the plugin binary needs it for the handshake and
/// the host prints its result there. Keep the returned guard alive for as
/// long as file logging should be flushed.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = config.env_filter()?;

    let stderr_layer = match config.format {
        LogFormat::Text => fmt::layer().with_writer(std::io::stderr).with_target(true).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .boxed(),
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("cannot create log dir {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(daily(dir, &config.file_name));
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(guard)
}
