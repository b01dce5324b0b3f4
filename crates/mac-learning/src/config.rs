//! Subsystem configuration.
//!
//! Loaded from a TOML file and overridden from the command line. Per-VRF
//! aging timeouts are not part of this file; they come from the VRF objects
//! in the operational database.

use crate::error::{LearningError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for the learning subsystem.
///
/// ```toml
/// partition_count = 4
/// add_tokens = 1000
/// resync_tokens = 1000
/// delete_tokens = 1000
/// mac_ip_learning = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearningConfig {
    /// Number of learning partitions (shards).
    pub partition_count: usize,
    /// Capacity of the Add token pool.
    pub add_tokens: usize,
    /// Capacity of the Resync token pool.
    pub resync_tokens: usize,
    /// Capacity of the Delete token pool.
    pub delete_tokens: usize,
    /// Route traps carrying a source IP to the Mac-IP learning table when the
    /// virtual network has IP learning enabled.
    pub mac_ip_learning: bool,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            partition_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            add_tokens: 1000,
            resync_tokens: 1000,
            delete_tokens: 1000,
            mac_ip_learning: true,
        }
    }
}

impl LearningConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: LearningConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| LearningError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn with_partitions(mut self, partition_count: usize) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_tokens(mut self, add: usize, resync: usize, delete: usize) -> Self {
        self.add_tokens = add;
        self.resync_tokens = resync;
        self.delete_tokens = delete;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(LearningError::Config(
                "partition_count must be at least 1".to_string(),
            ));
        }
        for (name, capacity) in [
            ("add_tokens", self.add_tokens),
            ("resync_tokens", self.resync_tokens),
            ("delete_tokens", self.delete_tokens),
        ] {
            if capacity == 0 {
                return Err(LearningError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
