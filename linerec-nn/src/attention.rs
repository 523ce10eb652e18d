//! Attention primitives shared by the decoder.
//!
//! Provides the additive causal mask, a per-size mask cache, scaled
//! dot-product attention and a multi-head attention block.
//!
//! ## Usage
//!
//! ```ignore
//! use linerec_nn::attention::{generate_square_subsequent_mask, scaled_dot_product_attention};
//!
//! // (size, size) mask: 0 where j <= i, -inf elsewhere
//! let mask = generate_square_subsequent_mask(seq_len, &device)?;
//!
//! let output = scaled_dot_product_attention(&q, &k, &v, Some(&mask), scale)?;
//! ```

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use linerec_core::core::{RecResult, RecognitionError};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::dropout::{Dropout, Mode};
use crate::utils::candle_to_rec_inference;

/// Helper function to handle Metal device computation.
///
/// Metal backend doesn't support certain operations (arange, broadcast_*, etc.).
/// This helper executes operations on CPU for Metal devices, then transfers the
/// result back to Metal.
pub(crate) fn on_compute_device<F>(device: &Device, f: F) -> Result<Tensor>
where
    F: FnOnce(&Device) -> Result<Tensor>,
{
    if device.is_metal() {
        let tensor_on_cpu = f(&Device::Cpu)?;
        tensor_on_cpu.to_device(device)
    } else {
        f(device)
    }
}

/// Builds the `(size, size)` mask: 0 where `col <= row`, -inf elsewhere.
fn causal_mask(size: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    on_compute_device(device, |compute_device| {
        let row_idx = Tensor::arange(0u32, size as u32, compute_device)?.reshape((size, 1))?;
        let col_idx = Tensor::arange(0u32, size as u32, compute_device)?.reshape((1, size))?;
        let mask_cond = col_idx.broadcast_le(&row_idx)?;

        let zero = Tensor::new(0f32, compute_device)?
            .to_dtype(dtype)?
            .broadcast_as(mask_cond.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, compute_device)?
            .to_dtype(dtype)?
            .broadcast_as(mask_cond.shape())?;

        mask_cond.where_cond(&zero, &neg_inf)
    })
}

/// Generate a square `(size, size)` subsequent-position mask.
///
/// `mask[i][j]` is 0 when `j <= i` and -inf otherwise, to be added to the
/// attention scores before the softmax. Decoding position `i` can therefore
/// never attend to a later position.
///
/// # Errors
///
/// `InvalidConfiguration` when `size` is zero.
pub fn generate_square_subsequent_mask(size: usize, device: &Device) -> RecResult<Tensor> {
    if size == 0 {
        return Err(RecognitionError::invalid_configuration(
            "causal mask size must be at least 1",
        ));
    }
    causal_mask(size, DType::F32, device)
        .map_err(|e| candle_to_rec_inference("CausalMask", format!("build {size}x{size} mask"), e))
}

/// Number of sizes a [`MaskCache`] keeps unless told otherwise.
pub const DEFAULT_MASK_CACHE_CAPACITY: usize = 64;

/// Memoizes square causal masks by size.
///
/// Masks are immutable, so a cached tensor is handed out as a cheap clone.
/// At most `capacity` sizes are kept; once full, a size that is not cached
/// evicts the largest cached mask, unless the request is itself the largest,
/// in which case the mask is built and returned without being stored.
#[derive(Debug)]
pub struct MaskCache {
    device: Device,
    capacity: usize,
    masks: Mutex<HashMap<usize, Tensor>>,
}

impl MaskCache {
    /// Creates an empty cache producing masks on `device`, holding at most
    /// [`DEFAULT_MASK_CACHE_CAPACITY`] sizes.
    pub fn new(device: &Device) -> Self {
        Self::with_capacity(device, DEFAULT_MASK_CACHE_CAPACITY)
    }

    /// Creates an empty cache holding at most `capacity` sizes.
    ///
    /// A capacity of zero disables caching.
    pub fn with_capacity(device: &Device, capacity: usize) -> Self {
        Self {
            device: device.clone(),
            capacity,
            masks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the `(size, size)` mask, building it on first use.
    pub fn get(&self, size: usize) -> RecResult<Tensor> {
        let mut masks = self.masks.lock().map_err(|_| {
            RecognitionError::invalid_input("causal mask cache lock poisoned")
        })?;
        if let Some(mask) = masks.get(&size) {
            return Ok(mask.clone());
        }
        let mask = generate_square_subsequent_mask(size, &self.device)?;

        if masks.len() >= self.capacity {
            match masks.keys().copied().max() {
                Some(largest) if largest > size => {
                    masks.remove(&largest);
                    tracing::debug!("evicted causal mask of size {}", largest);
                }
                _ => return Ok(mask),
            }
        }
        tracing::debug!("cached causal mask of size {}", size);
        masks.insert(size, mask.clone());
        Ok(mask)
    }

    /// Maximum number of cached sizes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached sizes.
    pub fn len(&self) -> usize {
        self.masks.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Returns true when nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scaled dot-product attention.
///
/// Computes attention as: softmax(Q @ K^T * scale + mask) @ V
///
/// # Arguments
/// * `q` - Query tensor: (batch, heads, seq_q, head_dim)
/// * `k` - Key tensor: (batch, heads, seq_kv, head_dim)
/// * `v` - Value tensor: (batch, heads, seq_kv, head_dim)
/// * `mask` - Optional additive mask broadcastable to (batch, heads, seq_q, seq_kv)
/// * `scale` - Scaling factor (typically 1/sqrt(head_dim))
///
/// # Returns
/// Output tensor: (batch, heads, seq_q, head_dim)
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor> {
    let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

    let attn_weights = match mask {
        Some(m) => attn_weights.broadcast_add(m)?,
        None => attn_weights,
    };

    // Softmax in F32 for numerical stability
    let input_dtype = attn_weights.dtype();
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights.to_dtype(DType::F32)?)?
        .to_dtype(input_dtype)?;

    attn_weights.matmul(v)
}

/// Multi-head attention with separate query/key/value projections.
///
/// Inputs are batch-first: (batch, seq, embed_dim).
#[derive(Debug)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    dropout: Dropout,
}

impl MultiHeadAttention {
    /// Creates the projections under `vb`.
    ///
    /// `embed_dim` must be divisible by `num_heads`.
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        dropout: f32,
        seed: u64,
        vb: VarBuilder,
    ) -> RecResult<Self> {
        if num_heads == 0 || !embed_dim.is_multiple_of(num_heads) {
            return Err(RecognitionError::invalid_configuration(format!(
                "embed_dim {} must be divisible by num_heads {}",
                embed_dim, num_heads
            )));
        }
        let head_dim = embed_dim / num_heads;
        let load = |name: &str| {
            candle_nn::linear(embed_dim, embed_dim, vb.pp(name))
                .map_err(|e| candle_to_rec_inference("MultiHeadAttention", format!("load {name}"), e))
        };

        Ok(Self {
            q_proj: load("q_proj")?,
            k_proj: load("k_proj")?,
            v_proj: load("v_proj")?,
            out_proj: load("out_proj")?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            dropout: Dropout::new(dropout, seed)?,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attends from `query` (B, Sq, E) over `key_value` (B, Skv, E).
    ///
    /// Dropout is applied to the attention output in training mode.
    pub fn forward(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        mask: Option<&Tensor>,
        mode: Mode,
    ) -> RecResult<Tensor> {
        let run = || -> Result<Tensor> {
            let (batch_size, seq_len, _) = query.dims3()?;
            let q = self.split_heads(&self.q_proj.forward(query)?)?;
            let k = self.split_heads(&self.k_proj.forward(key_value)?)?;
            let v = self.split_heads(&self.v_proj.forward(key_value)?)?;

            let attn = scaled_dot_product_attention(&q, &k, &v, mask, self.scale)?;
            let attn = attn.transpose(1, 2)?.contiguous()?.reshape((
                batch_size,
                seq_len,
                self.num_heads * self.head_dim,
            ))?;
            self.out_proj.forward(&attn)
        };
        let output = run().map_err(|e| candle_to_rec_inference("MultiHeadAttention", "forward", e))?;
        self.dropout.forward(&output, mode)
    }
}
