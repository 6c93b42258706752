//! Bridge configuration file
//!
//! Every field is optional in the TOML file; command-line flags override
//! whatever the file sets.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use castmate_rpc::{CallPolicy, MethodNames};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port of the WebSocket host
pub const DEFAULT_PORT: u16 = 7891;

/// Errors while loading a config file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings shared by `serve` and `connect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Port the host listens on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pause between client reconnect attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Reject calls that get no response in this many milliseconds
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Prefix for the state and widget method names
    #[serde(default)]
    pub method_prefix: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            call_timeout_ms: None,
            method_prefix: String::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn methods(&self) -> MethodNames {
        MethodNames::with_prefix(&self.method_prefix)
    }

    pub fn call_policy(&self) -> CallPolicy {
        match self.call_timeout_ms {
            Some(ms) => CallPolicy::with_timeout(Duration::from_millis(ms)),
            None => CallPolicy::default(),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
