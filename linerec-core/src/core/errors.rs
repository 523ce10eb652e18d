//! Error types for the recognizer.
//!
//! This module defines the errors raised while building models and running
//! them: geometry and dimension precondition failures, configuration errors,
//! and wrapped tensor-backend failures. It also provides constructors that
//! attach the right context.
//!
//! # Usage
//!
//! ```rust
//! use linerec_core::core::errors::RecognitionError;
//!
//! let error = RecognitionError::dimension_mismatch("PositionalEncoding1d", 256, 128);
//! assert!(error.to_string().contains("expected 256"));
//!
//! let config_error = RecognitionError::invalid_configuration("tf_dim must be even");
//! assert!(matches!(config_error, RecognitionError::InvalidConfiguration { .. }));
//! ```

use thiserror::Error;

/// Enum representing different stages of processing.
///
/// Used to identify where a wrapped backend error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Error occurred during tensor operations.
    TensorOperation,
    /// Error occurred while converting images to tensors.
    ImageConversion,
    /// Error occurred while decoding model output into tokens.
    Decoding,
    /// Error occurred while computing a loss or a metric.
    Evaluation,
    /// Generic processing error.
    Generic,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::TensorOperation => write!(f, "tensor operation"),
            ProcessingStage::ImageConversion => write!(f, "image conversion"),
            ProcessingStage::Decoding => write!(f, "decoding"),
            ProcessingStage::Evaluation => write!(f, "evaluation"),
            ProcessingStage::Generic => write!(f, "processing"),
        }
    }
}

/// Enum representing the errors that can occur in the recognizer.
///
/// `InvalidGeometry`, `DimensionMismatch` and `InvalidConfiguration` are
/// deterministic precondition failures raised at the point of violation.
/// They are never retried and never leave partial output behind.
#[derive(Error, Debug)]
pub enum RecognitionError {
    /// Window, stride and image width (or height) are inconsistent.
    #[error("invalid geometry: {message}")]
    InvalidGeometry {
        /// A message describing the inconsistency.
        message: String,
    },

    /// A tensor's depth or spatial size does not match a precomputed table or layer.
    #[error("dimension mismatch in {component}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The component that rejected the input.
        component: String,
        /// The expected size.
        expected: usize,
        /// The actual size.
        actual: usize,
    },

    /// A configuration value is out of its valid domain.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// A message describing the configuration problem.
        message: String,
    },

    /// Error indicating invalid input.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// A message describing the invalid input.
        message: String,
    },

    /// Error raised by the tensor backend while running a model.
    #[error("inference failed in {model_name}: {context}")]
    Inference {
        /// Name of the model or layer.
        model_name: String,
        /// What the model was doing.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error occurred during processing.
    #[error("{kind} failed: {context}")]
    Processing {
        /// The stage of processing where the error occurred.
        kind: ProcessingStage,
        /// Additional context about the error.
        context: String,
        /// The underlying error that caused this error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error occurred while loading an image.
    #[error("image load")]
    ImageLoad(#[from] image::ImageError),

    /// IO error.
    #[error("io")]
    Io(#[from] std::io::Error),
}

/// Convenient result alias for recognizer operations.
pub type RecResult<T> = Result<T, RecognitionError>;

impl RecognitionError {
    /// Creates an `InvalidGeometry` error.
    pub fn invalid_geometry(message: impl Into<String>) -> Self {
        Self::InvalidGeometry {
            message: message.into(),
        }
    }

    /// Creates a `DimensionMismatch` error.
    ///
    /// # Arguments
    ///
    /// * `component` - The component that rejected the input.
    /// * `expected` - The size the component requires.
    /// * `actual` - The size it received.
    pub fn dimension_mismatch(component: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            component: component.into(),
            expected,
            actual,
        }
    }

    /// Creates an `InvalidConfiguration` error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Creates an `InvalidInput` error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates an `Inference` error for a named model.
    pub fn inference(
        model_name: impl Into<String>,
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Inference {
            model_name: model_name.into(),
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates a `Processing` error for the given stage.
    ///
    /// # Arguments
    ///
    /// * `kind` - The stage of processing where the error occurred.
    /// * `context` - Additional context about the error.
    /// * `error` - The underlying error that caused this error.
    pub fn processing_error(
        kind: ProcessingStage,
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            kind,
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates a `Processing` error for tensor operations.
    pub fn tensor_operation(
        context: impl Into<String>,
        error: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::processing_error(ProcessingStage::TensorOperation, context, error)
    }

    /// Returns true for the deterministic precondition failures
    /// (`InvalidGeometry`, `DimensionMismatch`, `InvalidConfiguration`).
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidGeometry { .. }
                | Self::DimensionMismatch { .. }
                | Self::InvalidConfiguration { .. }
        )
    }
}

/// Configuration validation failures surface as `InvalidConfiguration`.
impl From<crate::core::config::ConfigError> for RecognitionError {
    fn from(error: crate::core::config::ConfigError) -> Self {
        Self::InvalidConfiguration {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for RecognitionError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidConfiguration {
            message: format!("failed to parse configuration: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigError;

    #[test]
    fn test_dimension_mismatch_message() {
        let err = RecognitionError::dimension_mismatch("PositionalEncoding2d", 64, 32);
        assert_eq!(
            err.to_string(),
            "dimension mismatch in PositionalEncoding2d: expected 64, got 32"
        );
        assert!(err.is_precondition());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: RecognitionError = ConfigError::InvalidConfig {
            message: "tf_dim must be even, got 3".to_string(),
        }
        .into();
        assert!(matches!(err, RecognitionError::InvalidConfiguration { .. }));
        assert!(err.to_string().contains("tf_dim must be even"));
    }

    #[test]
    fn test_processing_error_keeps_source() {
        use std::error::Error;

        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad buffer");
        let err = RecognitionError::tensor_operation("stack windows", io);
        assert_eq!(err.to_string(), "tensor operation failed: stack windows");
        assert!(err.source().is_some());
        assert!(!err.is_precondition());
    }
}
