//! # linerec nn
//!
//! Candle implementation of the line recognizer.
//!
//! This crate turns line images into character sequences on top of the
//! types from `linerec-core`.
//!
//! ## Module Structure
//!
//! - `sliding_window` - Sliding-window sequence encoder and execution strategies
//! - `cnn` - `FeatureExtractor` trait and the per-window CNN
//! - `positional` - 1-D and 2-D sinusoidal positional encodings
//! - `attention` - Causal mask, mask cache and multi-head attention
//! - `dropout` - Seedable dropout and the train/eval `Mode`
//! - `line_cnn_simple` - One class distribution per window
//! - `line_cnn_transformer` - Window CNN encoder with a transformer decoder
//! - `training` - Masked cross-entropy and the `Trainer`
//! - `utils` - Device parsing, candle error bridging, tensor helpers
//!
//! ## Features
//!
//! - `cuda` - Enable CUDA support for GPU acceleration
//! - `metal` - Enable Metal support on Apple silicon
//!
//! ## Device Configuration
//!
//! Use [`utils::parse_device`] to parse device strings:
//!
//! ```no_run
//! use linerec_nn::utils::parse_device;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = parse_device("cuda:0")?;
//! # let _ = device;
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod cnn;
pub mod dropout;
pub mod line_cnn_simple;
pub mod line_cnn_transformer;
pub mod positional;
pub mod sliding_window;
pub mod training;
pub mod utils;

// Re-exports for convenience
pub use attention::{MaskCache, generate_square_subsequent_mask};
pub use cnn::{CnnConfig, FeatureExtractor, WindowCnn};
pub use dropout::{Dropout, Mode};
pub use line_cnn_simple::{LineCnnSimple, LineCnnSimpleConfig};
pub use line_cnn_transformer::{LineCnnTransformer, LineCnnTransformerConfig};
pub use positional::{PositionalEncoding1d, PositionalEncoding2d};
pub use sliding_window::{SlidingWindowEncoder, WindowExecution};
pub use training::{SequenceModel, StepMetrics, Trainer, TrainerConfig, masked_cross_entropy};
