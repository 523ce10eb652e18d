//! Geometry processors that run before any tensor work.

pub mod windows;

pub use windows::{WindowGeometry, WindowSpan, compute_windows, sequence_length};
