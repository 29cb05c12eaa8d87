//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_DOWNLOADS, PROGRESS_DEBOUNCE, READ_TIMEOUT_SECS,
};
use crate::download::redirect::MAX_REDIRECT_ATTEMPTS;
use crate::rights::{DEFAULT_SUPPORTED_TYPES, RightsClassifier};

/// Upper bound for `max_concurrent_downloads`.
const MAX_CONCURRENT_DOWNLOADS_LIMIT: usize = 64;

/// Upper bound for `max_redirects`.
const MAX_REDIRECTS_LIMIT: u32 = 50;

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting is out of range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    /// A required text setting is empty.
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

/// Settings for a [`FulfillmentCoordinator`](crate::coordinator::FulfillmentCoordinator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root under which each account keeps its content.
    pub content_base_dir: PathBuf,
    /// Account whose content directory is used.
    pub account_id: String,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,
    /// Redirects followed per task before the transfer fails.
    pub max_redirects: u32,
    /// Debounce window for change notifications.
    pub progress_debounce: Duration,
    /// Transfers allowed to run at once; further starts are queued.
    pub max_concurrent_downloads: usize,
    /// Content types accepted without rights management.
    pub supported_types: Vec<String>,
    /// Treat `application/json` responses as Overdrive manifests.
    pub overdrive_manifests: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            content_base_dir: PathBuf::from("."),
            account_id: "default".to_string(),
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            max_redirects: MAX_REDIRECT_ATTEMPTS,
            progress_debounce: PROGRESS_DEBOUNCE,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            supported_types: DEFAULT_SUPPORTED_TYPES
                .iter()
                .map(ToString::to_string)
                .collect(),
            overdrive_manifests: true,
        }
    }
}

impl EngineConfig {
    /// Default settings rooted at `content_base_dir`.
    #[must_use]
    pub fn new(content_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_base_dir: content_base_dir.into(),
            ..Self::default()
        }
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account_id.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "account_id",
            });
        }
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1, 600)?;
        check_range("read_timeout_secs", self.read_timeout_secs, 1, 86_400)?;
        check_range(
            "max_redirects",
            u64::from(self.max_redirects),
            1,
            u64::from(MAX_REDIRECTS_LIMIT),
        )?;
        check_range(
            "max_concurrent_downloads",
            self.max_concurrent_downloads as u64,
            1,
            MAX_CONCURRENT_DOWNLOADS_LIMIT as u64,
        )?;
        Ok(())
    }

    /// Classifier built from the allow-list and the Overdrive switch.
    #[must_use]
    pub fn classifier(&self) -> RightsClassifier {
        RightsClassifier::new(&self.supported_types, self.overdrive_manifests)
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            min,
            max,
            value,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rights::RightsManagementKind;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_redirects, 10);
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.progress_debounce, Duration::from_millis(200));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = EngineConfig {
            max_concurrent_downloads: 0,
            ..EngineConfig::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(
            msg.contains("max_concurrent_downloads"),
            "Expected field name in: {msg}"
        );
    }

    #[test]
    fn test_validate_rejects_blank_account() {
        let config = EngineConfig {
            account_id: "  ".to_string(),
            ..EngineConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Empty {
                field: "account_id"
            })
        );
    }

    #[test]
    fn test_classifier_follows_overdrive_switch() {
        let mut config = EngineConfig::default();
        assert_eq!(
            config.classifier().classify("application/json"),
            RightsManagementKind::OverdriveManifestJson
        );
        config.overdrive_manifests = false;
        assert_eq!(
            config.classifier().classify("application/json"),
            RightsManagementKind::Unknown
        );
    }
}
