//! tracing subscriber setup for applications embedding the engine.
//!
//! Mirrors the desktop app's startup: `RUST_LOG` wins when set, otherwise the
//! configured filter applies; stderr output and a daily-rotating log file are
//! both optional layers on one registry.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "fluux_xmpp_engine=info,info";

/// Log file name inside `log_dir`; rotation appends the date.
const LOG_FILE_NAME: &str = "xmpp-engine.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `fluux_xmpp_engine::reader=debug,info`.
    pub filter: Option<String>,
    /// Directory for the rotating log file; no file output when unset.
    pub log_dir: Option<PathBuf>,
    pub stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: None,
            log_dir: None,
            stderr: true,
        }
    }
}

impl LogConfig {
    /// The effective filter directives.
    pub fn directives(&self) -> String {
        match std::env::var("RUST_LOG") {
            Ok(env) if !env.is_empty() => env,
            _ => self
                .filter
                .clone()
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, EngineError> {
        EnvFilter::try_new(self.directives())
            .map_err(|e| EngineError::Config(format!("invalid log filter: {}", e)))
    }
}

/// Installs the global subscriber.
///
/// Returns the file writer's guard when a log file is configured; keep it
/// alive for as long as logs should be flushed. Fails if a global subscriber
/// is already installed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, EngineError> {
    let (file_layer, guard) = match config.log_dir {
        Some(ref log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                EngineError::Config(format!(
                    "could not create log directory '{}': {}",
                    log_dir.display(),
                    e
                ))
            })?;
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(config.env_filter()?);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = if config.stderr {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(config.env_filter()?),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| EngineError::Config(format!("could not install log subscriber: {}", e)))?;

    Ok(guard)
}
