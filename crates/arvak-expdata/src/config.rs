//! Configuration for experiment data containers.
//!
//! Supports loading configuration from:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with ARVAK_EXPDATA_ prefix)
//!
//! Environment variables take precedence over file values, which take
//! precedence over defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every container built from the same config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpDataConfig {
    /// Serialized metadata larger than this (bytes) is uploaded as a side file.
    #[serde(default = "default_metadata_size_limit")]
    pub metadata_size_limit: usize,

    /// Upper bound on concurrent service workers during `save`.
    #[serde(default = "default_max_save_workers")]
    pub max_save_workers: usize,

    /// Worker count used by `SaveOptions::default()`.
    #[serde(default = "default_save_workers")]
    pub default_save_workers: usize,

    /// Analysis callbacks admitted concurrently (one running, one waiting).
    #[serde(default = "default_analysis_workers")]
    pub analysis_workers: usize,

    /// How long `cancel_analysis` waits for cancelled callbacks to settle.
    #[serde(default = "default_cancel_settle_timeout_ms")]
    pub cancel_settle_timeout_ms: u64,

    /// Name of the side file holding oversized metadata.
    #[serde(default = "default_metadata_filename")]
    pub metadata_filename: String,
}

fn default_metadata_size_limit() -> usize {
    10_000
}

fn default_max_save_workers() -> usize {
    10
}

fn default_save_workers() -> usize {
    3
}

fn default_analysis_workers() -> usize {
    2
}

fn default_cancel_settle_timeout_ms() -> u64 {
    1000
}

fn default_metadata_filename() -> String {
    "metadata.json".to_string()
}

impl Default for ExpDataConfig {
    fn default() -> Self {
        Self {
            metadata_size_limit: default_metadata_size_limit(),
            max_save_workers: default_max_save_workers(),
            default_save_workers: default_save_workers(),
            analysis_workers: default_analysis_workers(),
            cancel_settle_timeout_ms: default_cancel_settle_timeout_ms(),
            metadata_filename: default_metadata_filename(),
        }
    }
}

impl ExpDataConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: ExpDataConfig = serde_yaml_ng::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Load configuration: file (if any), then environment overrides, then validation.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Only variables that are set and parse override the current values.
    fn merge_env(mut self) -> Self {
        if let Some(val) = env_parse("ARVAK_EXPDATA_METADATA_SIZE_LIMIT") {
            self.metadata_size_limit = val;
        }
        if let Some(val) = env_parse("ARVAK_EXPDATA_MAX_SAVE_WORKERS") {
            self.max_save_workers = val;
        }
        if let Some(val) = env_parse("ARVAK_EXPDATA_SAVE_WORKERS") {
            self.default_save_workers = val;
        }
        if let Some(val) = env_parse("ARVAK_EXPDATA_ANALYSIS_WORKERS") {
            self.analysis_workers = val;
        }
        if let Some(val) = env_parse("ARVAK_EXPDATA_CANCEL_SETTLE_MS") {
            self.cancel_settle_timeout_ms = val;
        }
        if let Ok(name) = std::env::var("ARVAK_EXPDATA_METADATA_FILENAME") {
            self.metadata_filename = name;
        }
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_save_workers == 0 {
            return Err(ConfigError::ValidationError(
                "max_save_workers must be greater than 0".to_string(),
            ));
        }
        if self.default_save_workers == 0 || self.default_save_workers > self.max_save_workers {
            return Err(ConfigError::ValidationError(format!(
                "default_save_workers must be between 1 and {}",
                self.max_save_workers
            )));
        }
        if self.analysis_workers == 0 {
            return Err(ConfigError::ValidationError(
                "analysis_workers must be greater than 0".to_string(),
            ));
        }
        if self.metadata_filename.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "metadata_filename must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cancel_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_settle_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExpDataConfig::default();
        assert_eq!(config.metadata_size_limit, 10_000);
        assert_eq!(config.max_save_workers, 10);
        assert_eq!(config.default_save_workers, 3);
        assert_eq!(config.analysis_workers, 2);
        assert_eq!(config.metadata_filename, "metadata.json");
        assert_eq!(config.cancel_settle_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_workers() {
        let mut config = ExpDataConfig::default();
        config.default_save_workers = 20;
        assert!(config.validate().is_err());

        let mut config = ExpDataConfig::default();
        config.analysis_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expdata.yaml");
        std::fs::write(&path, "metadata_size_limit: 512\nmetadata_filename: meta.json\n").unwrap();

        let config = ExpDataConfig::from_file(&path).unwrap();
        assert_eq!(config.metadata_size_limit, 512);
        assert_eq!(config.metadata_filename, "meta.json");
        assert_eq!(config.max_save_workers, 10);
    }

    #[test]
    fn test_from_file_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "metadata_size_limit: [not, a, number]\n").unwrap();

        let err = ExpDataConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
