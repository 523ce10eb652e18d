//! Fixed sinusoidal positional encodings.
//!
//! Two independent encoders live here:
//!
//! - [`PositionalEncoding1d`] - the classic sequence encoding, added to
//!   sequence-major `(S, B, E)` token embeddings before decoding.
//! - [`PositionalEncoding2d`] - a spatial encoding for `(B, E, H, W)` feature
//!   maps, where the first half of the depth encodes the row and the second
//!   half the column.
//!
//! Both tables are computed once at construction and never updated; they are
//! plain tensors owned by the encoder, not trainable variables.

use candle_core::{Device, Tensor};
use linerec_core::core::validation::{
    validate_axis, validate_axis_capacity, validate_even, validate_tensor_shape,
};
use linerec_core::core::{RecResult, RecognitionError};

use crate::dropout::{Dropout, Mode};
use crate::utils::candle_to_rec_inference;

/// Builds the raw `(max_len, d_model)` sinusoid values, row-major.
///
/// `pe[p, 2k] = sin(p / 10000^(2k / d_model))` and
/// `pe[p, 2k + 1] = cos(p / 10000^(2k / d_model))`.
fn sinusoid_values(d_model: usize, max_len: usize) -> Vec<f32> {
    let log_base = -(10000f64.ln()) / d_model as f64;
    let div_terms: Vec<f64> = (0..d_model)
        .map(|i| ((i - i % 2) as f64 * log_base).exp())
        .collect();

    let mut values = Vec::with_capacity(max_len * d_model);
    for position in 0..max_len {
        for (i, div) in div_terms.iter().enumerate() {
            let angle = position as f64 * div;
            let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            values.push(value as f32);
        }
    }
    values
}

/// Classic Attention-is-all-you-need positional encoding.
#[derive(Debug)]
pub struct PositionalEncoding1d {
    pe: Tensor,
    d_model: usize,
    max_len: usize,
    dropout: Dropout,
}

impl PositionalEncoding1d {
    /// Builds the `(max_len, 1, d_model)` table.
    ///
    /// # Arguments
    ///
    /// * `d_model` - Embedding depth.
    /// * `max_len` - Number of positions to precompute.
    /// * `dropout` - Drop probability applied after the addition in training mode.
    /// * `seed` - Seed of the dropout stream.
    /// * `device` - Device the table lives on.
    pub fn new(
        d_model: usize,
        max_len: usize,
        dropout: f32,
        seed: u64,
        device: &Device,
    ) -> RecResult<Self> {
        let pe = Self::make_pe(d_model, max_len, device)?;
        Ok(Self {
            pe,
            d_model,
            max_len,
            dropout: Dropout::new(dropout, seed)?,
        })
    }

    /// Computes the `(max_len, 1, d_model)` sinusoid table.
    pub fn make_pe(d_model: usize, max_len: usize, device: &Device) -> RecResult<Tensor> {
        if d_model == 0 || max_len == 0 {
            return Err(RecognitionError::invalid_configuration(format!(
                "positional table needs positive sizes, got d_model={d_model}, max_len={max_len}"
            )));
        }
        Tensor::from_vec(sinusoid_values(d_model, max_len), (max_len, 1, d_model), device)
            .map_err(|e| candle_to_rec_inference("PositionalEncoding1d", "build table", e))
    }

    /// The precomputed `(max_len, 1, d_model)` table.
    pub fn table(&self) -> &Tensor {
        &self.pe
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Adds the encoding to a sequence-major `(S, B, d_model)` tensor.
    ///
    /// Dropout follows in training mode.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` when the depth differs from `d_model` or `S`
    /// exceeds the precomputed length.
    pub fn apply(&self, x: &Tensor, mode: Mode) -> RecResult<Tensor> {
        let dims = x.dims();
        validate_tensor_shape(dims, 3, "PositionalEncoding1d input (S, B, E)")?;
        validate_axis(dims, 2, self.d_model, "PositionalEncoding1d depth")?;
        validate_axis_capacity(dims, 0, self.max_len, "PositionalEncoding1d length")?;

        let encoded = self
            .pe
            .narrow(0, 0, dims[0])
            .and_then(|pe| pe.to_dtype(x.dtype()))
            .and_then(|pe| x.broadcast_add(&pe))
            .map_err(|e| candle_to_rec_inference("PositionalEncoding1d", "add table", e))?;
        self.dropout.forward(&encoded, mode)
    }
}

/// 2-D positional encoding for feature maps.
///
/// Half of the depth encodes the row index and the other half the column
/// index, following <https://arxiv.org/abs/2103.06450>.
#[derive(Debug, Clone)]
pub struct PositionalEncoding2d {
    pe: Tensor,
    d_model: usize,
    max_h: usize,
    max_w: usize,
}

impl PositionalEncoding2d {
    /// Builds the `(d_model, max_h, max_w)` table.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when `d_model` is odd or any size is zero.
    pub fn new(d_model: usize, max_h: usize, max_w: usize, device: &Device) -> RecResult<Self> {
        let pe = Self::make_pe(d_model, max_h, max_w, device)?;
        Ok(Self {
            pe,
            d_model,
            max_h,
            max_w,
        })
    }

    /// Computes the `(d_model, max_h, max_w)` table.
    ///
    /// A row table and a column table of depth `d_model / 2` are broadcast
    /// across the other spatial axis and concatenated along the depth.
    pub fn make_pe(
        d_model: usize,
        max_h: usize,
        max_w: usize,
        device: &Device,
    ) -> RecResult<Tensor> {
        validate_even(d_model, "PositionalEncoding2d")?;
        if d_model == 0 {
            return Err(RecognitionError::invalid_configuration(
                "PositionalEncoding2d depth must be positive",
            ));
        }
        let half = d_model / 2;

        // (max_h, 1, half) -> (half, max_h, 1) -> (half, max_h, max_w)
        let pe_h = PositionalEncoding1d::make_pe(half, max_h, device)?;
        // (max_w, 1, half) -> (half, 1, max_w) -> (half, max_h, max_w)
        let pe_w = PositionalEncoding1d::make_pe(half, max_w, device)?;

        let build = || -> candle_core::Result<Tensor> {
            let pe_h = pe_h
                .permute((2, 0, 1))?
                .broadcast_as((half, max_h, max_w))?
                .contiguous()?;
            let pe_w = pe_w
                .permute((2, 1, 0))?
                .broadcast_as((half, max_h, max_w))?
                .contiguous()?;
            Tensor::cat(&[&pe_h, &pe_w], 0)
        };
        build().map_err(|e| candle_to_rec_inference("PositionalEncoding2d", "build table", e))
    }

    /// The precomputed `(d_model, max_h, max_w)` table.
    pub fn table(&self) -> &Tensor {
        &self.pe
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    /// Adds the encoding to a `(B, d_model, H, W)` feature map.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` when the depth differs from `d_model`, or when `H`
    /// or `W` exceed the precomputed extent.
    pub fn apply(&self, x: &Tensor) -> RecResult<Tensor> {
        let dims = x.dims();
        validate_tensor_shape(dims, 4, "PositionalEncoding2d input (B, E, H, W)")?;
        validate_axis(dims, 1, self.d_model, "PositionalEncoding2d depth")?;
        validate_axis_capacity(dims, 2, self.max_h, "PositionalEncoding2d height")?;
        validate_axis_capacity(dims, 3, self.max_w, "PositionalEncoding2d width")?;

        self.pe
            .narrow(1, 0, dims[2])
            .and_then(|pe| pe.narrow(2, 0, dims[3]))
            .and_then(|pe| pe.to_dtype(x.dtype()))
            .and_then(|pe| x.broadcast_add(&pe))
            .map_err(|e| candle_to_rec_inference("PositionalEncoding2d", "add table", e))
    }
}
