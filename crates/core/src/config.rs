//! Mesh configuration
//!
//! Loaded from `peermesh.toml`. Every field has a default, so an empty or
//! missing file is a valid configuration.
//!
//! ```toml
//! heartbeat_interval_ms = 5000
//! channel_latency_ms = 50
//!
//! [relay]
//! addr = "127.0.0.1:7340"
//! min_backoff_ms = 1000
//! max_backoff_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_FILE: &str = "peermesh.toml";

/// Transport and relay tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Interval between heartbeat probes
    pub heartbeat_interval_ms: u64,
    /// Delay injected before delivering each channel message
    pub channel_latency_ms: u64,
    /// Signaling relay settings
    pub relay: RelayConfig,
}

/// Signaling relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay address used when none is given on the command line
    pub addr: Option<String>,
    /// Lower bound of the randomized reconnect delay
    pub min_backoff_ms: u64,
    /// Upper bound of the randomized reconnect delay
    pub max_backoff_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5000,
            channel_latency_ms: 50,
            relay: RelayConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: None,
            min_backoff_ms: 1000,
            max_backoff_ms: 5000,
        }
    }
}

impl MeshConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: MeshConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Platform config location, e.g. `~/.config/peermesh/peermesh.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "peermesh").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be positive".into()));
        }
        if self.relay.min_backoff_ms > self.relay.max_backoff_ms {
            return Err(Error::Config(format!(
                "relay.min_backoff_ms ({}) exceeds relay.max_backoff_ms ({})",
                self.relay.min_backoff_ms, self.relay.max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn channel_latency(&self) -> Duration {
        Duration::from_millis(self.channel_latency_ms)
    }
}
