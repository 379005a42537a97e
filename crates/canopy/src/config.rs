//! Timeout configuration
//!
//! Services usually keep their timeout budgets in configuration rather than
//! in code. [`TimeoutConfig`] maps operation names to budgets and is loaded
//! from `.canopy/config.toml`:
//!
//! ```toml
//! default_timeout_ms = 30000
//!
//! [operations]
//! db_query = 2000
//! http_call = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::{CanopyError, Result};

/// Timeout budgets per operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Budget for operations without their own entry
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Per-operation budgets in milliseconds
    #[serde(default)]
    pub operations: BTreeMap<String, u64>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl TimeoutConfig {
    /// Load configuration from `.canopy/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".canopy/config.toml");

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CanopyError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.canopy/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(".canopy");
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| CanopyError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(config_dir.join("config.toml"), content)?;
        Ok(())
    }

    pub fn with_operation(mut self, operation: impl Into<String>, timeout_ms: u64) -> Self {
        self.operations.insert(operation.into(), timeout_ms);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Budget for `operation`, falling back to the default
    pub fn timeout_for(&self, operation: &str) -> Duration {
        self.operations
            .get(operation)
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or_else(|| self.default_timeout())
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            operations: BTreeMap::new(),
        }
    }
}
