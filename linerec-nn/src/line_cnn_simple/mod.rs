//! Fixed-window line classifier.
//!
//! Slides a [`WindowCnn`](crate::cnn::WindowCnn) over the line and emits one
//! class distribution per window.

mod config;
mod model;

pub use config::LineCnnSimpleConfig;
pub use model::LineCnnSimple;
