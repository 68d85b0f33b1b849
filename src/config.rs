//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointKind, CheckpointManager, LocalCheckpointManager};
use crate::cpr::CheckpointConfig;
use crate::store::CprKvConfig;

const ENV_PREFIX: &str = "OXICPR__";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration schema.
///
/// ```toml
/// [store]
/// table_size = 16384
/// page_size_bits = 20
///
/// [checkpoint]
/// kind = "fold-over"
/// checkpoint_dir = "/var/lib/oxicpr"
/// keep_latest = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CprConfig {
    /// Store configuration.
    pub store: CprKvConfig,
    /// Checkpoint configuration.
    pub checkpoint: CheckpointConfig,
}

impl CprConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the `OXICPR_CONFIG` env var (if set),
    /// then apply `OXICPR__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("OXICPR_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if let Some(path) = key.strip_prefix(ENV_PREFIX) {
                let path = path.to_ascii_lowercase();
                self.apply_override(&key, &path, value.trim())?;
            }
        }
        self.validate()
    }

    fn apply_override(&mut self, key: &str, path: &str, value: &str) -> Result<(), ConfigError> {
        let parts: Vec<&str> = path.split("__").collect();
        match parts.as_slice() {
            ["store", "table_size"] => self.store.table_size = parse_value(key, value)?,
            ["store", "page_size_bits"] => self.store.page_size_bits = parse_value(key, value)?,
            ["store", "overflow_buckets"] => {
                self.store.overflow_buckets = parse_value(key, value)?;
            }
            ["store", "object_log_threshold"] => {
                self.store.object_log_threshold = match value {
                    "" | "none" => None,
                    v => Some(parse_value(key, v)?),
                };
            }
            ["checkpoint", "kind"] => self.checkpoint.kind = parse_kind(key, value)?,
            ["checkpoint", "barrier_timeout_ms"] => {
                self.checkpoint.barrier_timeout_ms = parse_value(key, value)?;
            }
            ["checkpoint", "checkpoint_dir"] => {
                self.checkpoint.checkpoint_dir = Some(PathBuf::from(value));
            }
            ["checkpoint", "keep_latest"] => {
                self.checkpoint.keep_latest = parse_value(key, value)?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Reject values the store would refuse at construction time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.store.table_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                key: "store.table_size".into(),
                value: self.store.table_size.to_string(),
            });
        }
        if self.checkpoint.barrier_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "checkpoint.barrier_timeout_ms".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Open a [`LocalCheckpointManager`] rooted at `checkpoint.checkpoint_dir`.
    pub fn open_manager(&self) -> Result<Arc<dyn CheckpointManager>, ConfigError> {
        let dir = self
            .checkpoint
            .checkpoint_dir
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("checkpoint.checkpoint_dir".into()))?;
        Ok(Arc::new(LocalCheckpointManager::new(dir)?))
    }
}

fn parse_kind(key: &str, value: &str) -> Result<CheckpointKind, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "snapshot" => Ok(CheckpointKind::Snapshot),
        "fold-over" | "fold_over" | "foldover" => Ok(CheckpointKind::FoldOver),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
