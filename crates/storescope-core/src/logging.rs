//! Structured logging setup for hosts and the CLI.

use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line text.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset (e.g. "info",
    /// "storescope_core=debug").
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Errors raised while installing the subscriber.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("failed to install subscriber: {0}")]
    Install(String),
}

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber. Idempotence is an error rather
/// than a silent no-op so double initialization in a host is visible.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
    };
    result.map_err(|err| LogError::Install(err.to_string()))?;

    let _ = INITIALIZED.set(());
    Ok(())
}

/// Whether [`init_logging`] has run in this process.
#[must_use]
pub fn is_logging_initialized() -> bool {
    INITIALIZED.get().is_some()
}
