//! Engine configuration
//!
//! Plain settings struct with defaults, environment loading and validation.

use std::env;
use std::str::FromStr;

use thiserror::Error;

/// Configuration error type
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Configuration validation failed for '{field}': {reason}")]
    ValidationFailed { field: String, reason: String },
}

impl ConfigError {
    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Create a validation failed error
    pub fn validation_failed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration for relation loading and cascades
#[derive(Debug, Clone, PartialEq)]
pub struct OdmConfig {
    /// Maximum number of keys sent in one batched fetch while preloading
    pub preload_batch_size: usize,
    /// Maximum number of inclusion levels resolved by one preload
    pub max_inclusion_depth: usize,
    /// Raise instead of resolving to none when a belongs_to key dangles
    pub raise_not_found_error: bool,
    /// Whether belongs_to relations are required unless marked optional
    pub belongs_to_required_by_default: bool,
}

impl Default for OdmConfig {
    fn default() -> Self {
        Self {
            preload_batch_size: 1000,
            max_inclusion_depth: 10,
            raise_not_found_error: false,
            belongs_to_required_by_default: true,
        }
    }
}

impl OdmConfig {
    /// Load configuration from `ODM_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            preload_batch_size: get_env_parsed(
                "ODM_PRELOAD_BATCH_SIZE",
                defaults.preload_batch_size,
            )?,
            max_inclusion_depth: get_env_parsed(
                "ODM_MAX_INCLUSION_DEPTH",
                defaults.max_inclusion_depth,
            )?,
            raise_not_found_error: get_env_bool(
                "ODM_RAISE_NOT_FOUND_ERROR",
                defaults.raise_not_found_error,
            )?,
            belongs_to_required_by_default: get_env_bool(
                "ODM_BELONGS_TO_REQUIRED",
                defaults.belongs_to_required_by_default,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preload_batch_size == 0 {
            return Err(ConfigError::validation_failed(
                "preload_batch_size",
                "must be greater than zero",
            ));
        }

        if self.max_inclusion_depth == 0 {
            return Err(ConfigError::validation_failed(
                "max_inclusion_depth",
                "must be greater than zero",
            ));
        }

        Ok(())
    }

    pub fn with_preload_batch_size(mut self, size: usize) -> Self {
        self.preload_batch_size = size;
        self
    }

    pub fn with_max_inclusion_depth(mut self, depth: usize) -> Self {
        self.max_inclusion_depth = depth;
        self
    }

    pub fn with_raise_not_found_error(mut self, raise: bool) -> Self {
        self.raise_not_found_error = raise;
        self
    }

    pub fn with_belongs_to_required_by_default(mut self, required: bool) -> Self {
        self.belongs_to_required_by_default = required;
        self
    }
}

fn get_env_parsed<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid_value(key, raw.clone(), "a positive integer")),
        Err(_) => Ok(default),
    }
}

fn get_env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_bool(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid_value(key, raw, "true or false")),
    }
}
