//! # linerec core
//!
//! Core types shared by the linerec crates.
//!
//! This crate provides:
//! - Error handling types
//! - Configuration validation (`ConfigValidator` trait and derive)
//! - Window geometry for sliding-window encoders
//! - Character mapping between tokens and class indices
//! - Character error rate metric
//! - Line image loading
//!
//! ## Modules
//!
//! * [`core`] - Error handling, configuration, constants and input validation
//! * [`domain`] - Domain types such as the character mapping
//! * [`metrics`] - Evaluation metrics
//! * [`processors`] - Geometry helpers used before any tensor work happens
//! * [`utils`] - Image loading utilities

// Lets the derive macro refer to `::linerec_core` from inside this crate too.
extern crate self as linerec_core;

pub mod core;
pub mod domain;
pub mod metrics;
pub mod processors;
pub mod utils;

pub use linerec_derive::ConfigValidator;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::config::{ConfigError, ConfigValidator};
    pub use crate::core::{RecResult, RecognitionError};

    pub use crate::domain::CharacterMapping;
    pub use crate::metrics::CharacterErrorRate;
    pub use crate::processors::{WindowGeometry, WindowSpan, compute_windows};

    pub use crate::utils::{gray_to_chw, load_line_image, load_line_images};
}
