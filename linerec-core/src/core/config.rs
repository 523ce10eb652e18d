//! Configuration utilities.
//!
//! This module provides the error type and the validation trait shared by
//! every model configuration. Implementations are usually generated with
//! `#[derive(ConfigValidator)]`.

use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error indicating that a configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Error indicating that a resource limit has been exceeded.
    #[error("resource limit exceeded: {message}")]
    ResourceLimitExceeded { message: String },
}

/// A trait for validating configuration parameters.
///
/// This trait provides methods for validating the sizes and probabilities
/// that model configurations are made of.
pub trait ConfigValidator {
    /// Validates the configuration.
    ///
    /// # Returns
    ///
    /// A Result indicating success or a ConfigError if validation fails.
    fn validate(&self) -> Result<(), ConfigError>;

    /// Returns the default configuration.
    fn get_defaults() -> Self
    where
        Self: Sized;

    /// Validates that a usize value is positive.
    ///
    /// # Arguments
    ///
    /// * `value` - The value to validate.
    /// * `field_name` - The name of the field being validated.
    fn validate_positive_usize(&self, value: usize, field_name: &str) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidConfig {
                message: format!("{} must be greater than 0", field_name),
            });
        }
        Ok(())
    }

    /// Validates that `numerator` is divisible by `denominator`.
    ///
    /// Used for head splitting, where the embedding depth has to be a
    /// multiple of the number of attention heads.
    fn validate_divisible(
        &self,
        numerator: usize,
        denominator: usize,
        numerator_name: &str,
        denominator_name: &str,
    ) -> Result<(), ConfigError> {
        if denominator == 0 || !numerator.is_multiple_of(denominator) {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "{} ({}) must be divisible by {} ({})",
                    numerator_name, numerator, denominator_name, denominator
                ),
            });
        }
        Ok(())
    }

    /// Validates a probability value.
    ///
    /// # Arguments
    ///
    /// * `value` - The probability to validate, in `[0, 1)`.
    /// * `field_name` - The name of the field being validated.
    fn validate_probability(&self, value: f32, field_name: &str) -> Result<(), ConfigError> {
        if !value.is_finite() || !(0.0..1.0).contains(&value) {
            return Err(ConfigError::InvalidConfig {
                message: format!("{} must be in [0, 1), got {}", field_name, value),
            });
        }
        Ok(())
    }
}

/// Loads a JSON configuration file and validates it.
///
/// # Arguments
///
/// * `path` - Path to the JSON file.
///
/// # Returns
///
/// The parsed and validated configuration.
pub fn load_config<T>(path: impl AsRef<Path>) -> crate::core::RecResult<T>
where
    T: DeserializeOwned + ConfigValidator,
{
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let config: T = serde_json::from_str(&contents)?;
    config.validate()?;
    tracing::debug!("loaded configuration from {}", path.display());
    Ok(config)
}
