//! Window CNN encoder with a transformer decoder.
//!
//! The encoder is the same sliding-window CNN as the simple model, emitting
//! `tf_dim` features per window. The decoder generates the transcription
//! token by token with causal self-attention and cross-attention over the
//! window features.

mod config;
mod decoder;
mod model;

pub use config::LineCnnTransformerConfig;
pub use model::LineCnnTransformer;
