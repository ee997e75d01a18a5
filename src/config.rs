//! Configuration for the pre-aggregation engine
//!
//! TOML-backed configuration with environment variable overrides and
//! sensible defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::storage::binlog::BinlogConfig;

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Wake replicator followers after each flushed bucket append
    #[serde(default = "default_true")]
    pub notify_on_put: bool,

    /// Base binlog settings
    #[serde(default = "default_binlog")]
    pub binlog: BinlogConfig,
}

fn default_true() -> bool {
    true
}

fn default_binlog() -> BinlogConfig {
    BinlogConfig::new(PathBuf::from("/var/lib/rollup-tsdb/binlog"))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notify_on_put: true,
            binlog: default_binlog(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration from a TOML file, then apply env overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with env overrides only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ROLLUP_NOTIFY_ON_PUT") {
            if let Ok(b) = v.parse() {
                self.notify_on_put = b;
            }
        }
        if let Ok(dir) = std::env::var("ROLLUP_BINLOG_DIR") {
            self.binlog.dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("ROLLUP_BINLOG_SEGMENT_BYTES") {
            if let Ok(n) = v.parse() {
                self.binlog.segment_bytes = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.notify_on_put);
        assert!(config.binlog.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            notify_on_put = false

            [binlog]
            dir = "/tmp/rollup-binlog"
            segment_bytes = 1048576
            "#,
        )
        .unwrap();
        assert!(!config.notify_on_put);
        assert_eq!(config.binlog.segment_bytes, 1_048_576);
        assert_eq!(config.binlog.dir, PathBuf::from("/tmp/rollup-binlog"));
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.notify_on_put);
    }
}
