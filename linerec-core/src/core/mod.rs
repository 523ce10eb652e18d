//! The core module of linerec.
//!
//! This module contains the fundamental pieces shared by every model:
//! - Configuration validation
//! - Constants used throughout the recognizer
//! - Error handling
//! - Input validation helpers

pub mod config;
pub mod constants;
pub mod errors;
pub mod validation;

pub use config::{ConfigError, ConfigValidator};
pub use constants::*;
pub use errors::{ProcessingStage, RecResult, RecognitionError};

/// Initializes the tracing subscriber for logging.
///
/// This function sets up the tracing subscriber with environment filter and formatting layer.
/// It's typically called at the start of an application to enable logging.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}
