use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RpcError;

/// Settings for the remote call layer, typically parsed from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// How often buffered calls are pushed to their targets, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Buffered calls per target that trigger an immediate flush.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// How long a request waits for its reply, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_flush_interval_ms() -> u64 { 1 }
fn default_max_batch() -> usize { 64 }
fn default_request_timeout_secs() -> u64 { 120 }

impl Default for RpcConfig {
    fn default() -> Self {
        Self::local()
    }
}

impl RpcConfig {
    /// Parse config from a TOML string. Accepts a bare table or an `[rpc]` section.
    pub fn from_toml(toml_str: &str) -> Result<Self, RpcError> {
        #[derive(Deserialize)]
        struct Wrapped {
            rpc: RpcConfig,
        }

        let table: toml::Table = toml::from_str(toml_str)?;
        let config = if table.contains_key("rpc") {
            toml::from_str::<Wrapped>(toml_str)?.rpc
        } else {
            toml::from_str::<RpcConfig>(toml_str)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RpcError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults for an in-process cluster.
    pub fn local() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            max_batch: default_max_batch(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.flush_interval_ms == 0 {
            return Err(RpcError::Config("flush_interval_ms must be at least 1".into()));
        }
        if self.max_batch == 0 {
            return Err(RpcError::Config("max_batch must be at least 1".into()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
