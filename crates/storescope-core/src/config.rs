//! Configuration for the relay and its hosts.
//!
//! All tunables have built-in defaults; a TOML file can override any subset.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for the relay core, keepalive scheduler, and provider limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Per-hop request deadline in seconds. Each hop times out
    /// independently; deadlines do not compound across hops.
    pub request_timeout_secs: u64,

    /// Keepalive signal period in seconds. Must sit well inside the host's
    /// idle-teardown window (30 s for the reference host).
    pub keepalive_interval_secs: u64,

    /// Default page size for paged record/cache reads.
    pub default_page_size: usize,

    /// Maximum key length accepted by key/value SET operations.
    pub max_key_len: usize,

    /// Maximum value size in bytes accepted by key/value SET operations.
    pub max_value_bytes: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            keepalive_interval_secs: 20,
            default_page_size: 50,
            max_key_len: 10_000,
            max_value_bytes: 10 * 1024 * 1024,
        }
    }
}

impl CoreConfig {
    /// Per-hop deadline as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Keepalive period as a [`Duration`].
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Parse a config from TOML text. Unknown keys are rejected so typos in
    /// an operator's file fail loudly instead of silently using defaults.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Load a config file, or defaults if the path does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }
}
