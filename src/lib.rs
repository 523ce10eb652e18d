//! # linerec
//!
//! Handwritten text line recognition in Rust.
//!
//! A line image is cut into fixed-width windows, each window is encoded by a
//! small CNN, and the resulting sequence is either classified window by
//! window or decoded into characters by a transformer.
//!
//! ## Features
//!
//! - Sliding-window sequence encoder with sequential, parallel and batched execution
//! - 1-D and 2-D sinusoidal positional encodings
//! - Causal attention masks with a per-size cache
//! - Fixed-window CNN classifier and CNN + transformer decoder
//! - Greedy autoregressive decoding
//! - Character error rate and a masked cross-entropy trainer
//!
//! ## Modules
//!
//! * [`core`] - Error handling, configuration validation and constants
//! * [`domain`] - Character mapping
//! * [`metrics`] - Character error rate
//! * [`processors`] - Window geometry
//! * [`utils`] - Line image loading
//! * [`nn`] - Candle models, encoders and the trainer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linerec::prelude::*;
//! use linerec::nn::utils::images_to_tensor;
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mapping = CharacterMapping::from_file("mapping.txt")?;
//! let config = LineCnnTransformerConfig::for_mapping(&mapping);
//!
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let model = LineCnnTransformer::new(config, &mapping, vb)?;
//!
//! let image = load_line_image(Path::new("line.png"))?;
//! let x = images_to_tensor(&[image], &Device::Cpu)?;
//! for ids in model.predict(&x)? {
//!     println!("{}", mapping.decode(&ids));
//! }
//! # Ok(())
//! # }
//! ```

pub use linerec_core::{core, domain, metrics, processors, utils};

/// Candle models, encoders and training.
pub mod nn {
    pub use linerec_nn::*;
}

/// Prelude module for convenient imports.
///
/// ```rust
/// use linerec::prelude::*;
/// ```
///
/// Included items cover the common path from a line image to text:
/// - Errors and configuration (`RecognitionError`, `RecResult`, `ConfigValidator`)
/// - Mapping, geometry and metrics (`CharacterMapping`, `compute_windows`, `CharacterErrorRate`)
/// - Models and the trainer (`LineCnnSimple`, `LineCnnTransformer`, `Trainer`)
/// - Image loading (`load_line_image`)
pub mod prelude {
    pub use linerec_core::prelude::*;

    pub use linerec_nn::{
        LineCnnSimple, LineCnnSimpleConfig, LineCnnTransformer, LineCnnTransformerConfig, Mode,
        PositionalEncoding1d, PositionalEncoding2d, SequenceModel, SlidingWindowEncoder, Trainer,
        TrainerConfig, WindowExecution, generate_square_subsequent_mask,
    };
}
