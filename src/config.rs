//! Upload configuration
//!
//! Loaded once from TOML and validated before any upload starts:
//!
//! ```toml
//! part_size = 16777216
//! max_concurrency = 8
//! max_part_retries = 5
//! upload_timeout_secs = 600
//!
//! [backoff]
//! init_backoff_ms = 200
//! max_backoff_ms = 20000
//! base = 2.0
//! ```

use crate::error::ConfigError;
use crate::retry::{BackoffConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Default part size (8 MiB)
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

pub const DEFAULT_MAX_PART_RETRIES: u32 = 3;

/// Settings shared by every upload a coordinator runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Size of every part except the last, in bytes
    #[validate(range(min = 1))]
    pub part_size: u64,

    /// Part uploads allowed in flight at once
    #[validate(range(min = 1, max = 1024))]
    pub max_concurrency: usize,

    /// Retries per part for transient failures
    #[validate(range(max = 32))]
    pub max_part_retries: u32,

    #[validate(nested)]
    pub backoff: BackoffSettings,

    /// Abort the whole upload once this many seconds have passed
    #[validate(range(min = 1))]
    pub upload_timeout_secs: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_part_retries: DEFAULT_MAX_PART_RETRIES,
            backoff: BackoffSettings::default(),
            upload_timeout_secs: None,
        }
    }
}

/// Backoff between part retries, as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_backoff_bounds"))]
pub struct BackoffSettings {
    #[validate(range(min = 1))]
    pub init_backoff_ms: u64,

    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,

    #[validate(range(min = 1.0, max = 10.0))]
    pub base: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            init_backoff_ms: 100,
            max_backoff_ms: 15_000,
            base: 2.0,
        }
    }
}

fn validate_backoff_bounds(settings: &BackoffSettings) -> Result<(), ValidationError> {
    if settings.init_backoff_ms > settings.max_backoff_ms {
        return Err(ValidationError::new("init_backoff_exceeds_max"));
    }
    Ok(())
}

impl From<&BackoffSettings> for BackoffConfig {
    fn from(settings: &BackoffSettings) -> Self {
        BackoffConfig {
            init_backoff: Duration::from_millis(settings.init_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            base: settings.base,
        }
    }
}

impl UploadConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: UploadConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_part_retries,
            backoff: BackoffConfig::from(&self.backoff),
        }
    }

    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = UploadConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.part_size, 8 * 1024 * 1024);
        assert_eq!(config.upload_timeout(), None);
    }

    #[test]
    fn test_parse_full_document() {
        let config = UploadConfig::from_toml_str(
            r#"
            part_size = 5242880
            max_concurrency = 3
            max_part_retries = 5
            upload_timeout_secs = 30

            [backoff]
            init_backoff_ms = 50
            max_backoff_ms = 1000
            base = 3.0
            "#,
        )
        .unwrap();

        assert_eq!(config.part_size, 5 * 1024 * 1024);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.upload_timeout(), Some(Duration::from_secs(30)));

        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.backoff.init_backoff, Duration::from_millis(50));
        assert_eq!(retry.backoff.max_backoff, Duration::from_secs(1));
        assert_eq!(retry.backoff.base, 3.0);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = UploadConfig::from_toml_str("max_concurrency = 16").unwrap();
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
        assert_eq!(config.backoff, BackoffSettings::default());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(matches!(
            UploadConfig::from_toml_str("part_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            UploadConfig::from_toml_str("max_concurrency = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            UploadConfig::from_toml_str("max_part_retries = 100"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            UploadConfig::from_toml_str("[backoff]\ninit_backoff_ms = 500\nmax_backoff_ms = 100"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            UploadConfig::from_toml_str("part_size = \"big\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            UploadConfig::from_toml_str("unknown_setting = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chunkup.toml");
        std::fs::write(&path, "part_size = 1048576\n").unwrap();

        let config = UploadConfig::from_file(&path).unwrap();
        assert_eq!(config.part_size, 1024 * 1024);

        assert!(matches!(
            UploadConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
