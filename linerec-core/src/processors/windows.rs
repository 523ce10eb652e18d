//! Sliding-window geometry over the width axis of a line image.
//!
//! A line of width `W` is covered by windows of width `WW` whose starts are
//! `WS` pixels apart. The number of windows is the sequence length the
//! encoder produces:
//!
//! ```text
//! S = floor((W - WW) / WS) + 1
//! ```
//!
//! Trailing columns that do not fill a whole window are ignored.

use crate::core::validation::validate_positive;
use crate::core::{RecResult, RecognitionError};
use serde::{Deserialize, Serialize};

/// Half-open column range `[start, end)` covered by one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSpan {
    /// First column of the window.
    pub start: usize,
    /// One past the last column of the window.
    pub end: usize,
}

impl WindowSpan {
    /// Number of columns covered by the window.
    pub fn width(&self) -> usize {
        self.end - self.start
    }
}

/// Result of laying windows over an image width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    /// Image width the geometry was computed for.
    pub width: usize,
    /// Width of every window.
    pub window_width: usize,
    /// Offset between consecutive window starts.
    pub stride: usize,
    /// Window spans in increasing order, starting at column 0.
    pub spans: Vec<WindowSpan>,
}

impl WindowGeometry {
    /// Number of windows, i.e. the sequence length `S`.
    pub fn sequence_length(&self) -> usize {
        self.spans.len()
    }

    /// The spans that survive an optional output length limit.
    ///
    /// The earliest windows are kept and trailing ones dropped.
    pub fn limited_spans(&self, limit: Option<usize>) -> &[WindowSpan] {
        match limit {
            Some(limit) if limit < self.spans.len() => &self.spans[..limit],
            _ => &self.spans,
        }
    }

    /// Returns true when consecutive windows share columns.
    pub fn is_overlapping(&self) -> bool {
        self.stride < self.window_width
    }
}

/// Computes the sequence length for an image width without materializing spans.
///
/// # Errors
///
/// * `InvalidConfiguration` when `window_width` or `stride` is zero.
/// * `InvalidGeometry` when `width < window_width`.
pub fn sequence_length(width: usize, window_width: usize, stride: usize) -> RecResult<usize> {
    validate_positive(window_width, "window_width")?;
    validate_positive(stride, "window_stride")?;
    if width < window_width {
        return Err(RecognitionError::invalid_geometry(format!(
            "image width {} is smaller than window width {}",
            width, window_width
        )));
    }
    Ok((width - window_width) / stride + 1)
}

/// Lays windows of `window_width` columns, `stride` columns apart, over an
/// image of `width` columns.
///
/// # Arguments
///
/// * `width` - Image width in pixels.
/// * `window_width` - Width of each window.
/// * `stride` - Offset between consecutive window starts.
///
/// # Returns
///
/// The geometry with `S = floor((width - window_width) / stride) + 1` spans,
/// `spans[s] = [s * stride, s * stride + window_width)`.
pub fn compute_windows(width: usize, window_width: usize, stride: usize) -> RecResult<WindowGeometry> {
    let count = sequence_length(width, window_width, stride)?;
    let spans = (0..count)
        .map(|s| {
            let start = s * stride;
            WindowSpan {
                start,
                end: start + window_width,
            }
        })
        .collect();

    Ok(WindowGeometry {
        width,
        window_width,
        stride,
        spans,
    })
}
