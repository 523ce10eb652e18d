//! Evaluation metrics.

pub mod cer;

pub use cer::{CharacterErrorRate, levenshtein_distance};
