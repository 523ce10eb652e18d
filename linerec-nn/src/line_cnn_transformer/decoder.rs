//! Post-norm transformer decoder.
//!
//! Each layer runs causal self-attention over the target tokens,
//! cross-attention over the encoder memory and a ReLU feed-forward block,
//! with a residual connection and a layer norm after every sub-block.

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};
use linerec_core::core::RecResult;

use crate::attention::MultiHeadAttention;
use crate::dropout::{Dropout, Mode};
use crate::utils::candle_to_rec_inference;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Seeds consumed by one layer's dropout streams.
const SEEDS_PER_LAYER: u64 = 8;

/// Shape of one decoder layer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecoderLayerSpec {
    pub d_model: usize,
    pub num_heads: usize,
    pub ff_dim: usize,
    pub dropout: f32,
}

#[derive(Debug)]
pub(crate) struct TransformerDecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    ff_dropout: Dropout,
    out_dropout: Dropout,
}

impl TransformerDecoderLayer {
    fn new(spec: DecoderLayerSpec, seed: u64, vb: VarBuilder) -> RecResult<Self> {
        let load_err = |what: &'static str| {
            move |e: candle_core::Error| {
                candle_to_rec_inference("TransformerDecoderLayer", format!("load {what}"), e)
            }
        };

        Ok(Self {
            self_attn: MultiHeadAttention::new(
                spec.d_model,
                spec.num_heads,
                spec.dropout,
                seed,
                vb.pp("self_attn"),
            )?,
            cross_attn: MultiHeadAttention::new(
                spec.d_model,
                spec.num_heads,
                spec.dropout,
                seed.wrapping_add(1),
                vb.pp("cross_attn"),
            )?,
            linear1: candle_nn::linear(spec.d_model, spec.ff_dim, vb.pp("linear1"))
                .map_err(load_err("linear1"))?,
            linear2: candle_nn::linear(spec.ff_dim, spec.d_model, vb.pp("linear2"))
                .map_err(load_err("linear2"))?,
            norm1: candle_nn::layer_norm(spec.d_model, LAYER_NORM_EPS, vb.pp("norm1"))
                .map_err(load_err("norm1"))?,
            norm2: candle_nn::layer_norm(spec.d_model, LAYER_NORM_EPS, vb.pp("norm2"))
                .map_err(load_err("norm2"))?,
            norm3: candle_nn::layer_norm(spec.d_model, LAYER_NORM_EPS, vb.pp("norm3"))
                .map_err(load_err("norm3"))?,
            ff_dropout: Dropout::new(spec.dropout, seed.wrapping_add(2))?,
            out_dropout: Dropout::new(spec.dropout, seed.wrapping_add(3))?,
        })
    }

    /// `tgt` is `(B, Sy, E)`, `memory` is `(B, S, E)`.
    fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        tgt_mask: Option<&Tensor>,
        mode: Mode,
    ) -> RecResult<Tensor> {
        let err = |context: &'static str| {
            move |e: candle_core::Error| {
                candle_to_rec_inference("TransformerDecoderLayer", context, e)
            }
        };

        let attended = self.self_attn.forward(tgt, tgt, tgt_mask, mode)?;
        let x = (tgt + attended)
            .and_then(|x| self.norm1.forward(&x))
            .map_err(err("self-attention residual"))?;

        let attended = self.cross_attn.forward(&x, memory, None, mode)?;
        let x = (&x + attended)
            .and_then(|x| self.norm2.forward(&x))
            .map_err(err("cross-attention residual"))?;

        let hidden = self
            .linear1
            .forward(&x)
            .and_then(|h| h.relu())
            .map_err(err("feed-forward"))?;
        let hidden = self.ff_dropout.forward(&hidden, mode)?;
        let hidden = self.linear2.forward(&hidden).map_err(err("feed-forward"))?;
        let hidden = self.out_dropout.forward(&hidden, mode)?;

        (&x + hidden)
            .and_then(|x| self.norm3.forward(&x))
            .map_err(err("feed-forward residual"))
    }
}

/// Stack of [`TransformerDecoderLayer`]s.
#[derive(Debug)]
pub(crate) struct TransformerDecoder {
    layers: Vec<TransformerDecoderLayer>,
}

impl TransformerDecoder {
    pub fn new(
        spec: DecoderLayerSpec,
        num_layers: usize,
        seed: u64,
        vb: VarBuilder,
    ) -> RecResult<Self> {
        let layers = (0..num_layers)
            .map(|i| {
                TransformerDecoderLayer::new(
                    spec,
                    seed.wrapping_add(i as u64 * SEEDS_PER_LAYER),
                    vb.pp(format!("layers.{i}")),
                )
            })
            .collect::<RecResult<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        tgt_mask: Option<&Tensor>,
        mode: Mode,
    ) -> RecResult<Tensor> {
        let mut x = tgt.clone();
        for layer in &self.layers {
            x = layer.forward(&x, memory, tgt_mask, mode)?;
        }
        Ok(x)
    }
}
