use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Embedding, Init, Linear, VarBuilder};
use linerec_core::core::config::ConfigValidator;
use linerec_core::core::{RecResult, RecognitionError};
use linerec_core::domain::CharacterMapping;
use std::path::Path;

use super::config::LineCnnTransformerConfig;
use super::decoder::{DecoderLayerSpec, TransformerDecoder};
use crate::attention::MaskCache;
use crate::cnn::WindowCnn;
use crate::dropout::Mode;
use crate::positional::{PositionalEncoding1d, PositionalEncoding2d};
use crate::sliding_window::SlidingWindowEncoder;
use crate::training::SequenceModel;
use crate::utils::{argmax_last, candle_to_rec_inference, tokens_to_vec};

const INIT_RANGE: f64 = 0.1;

/// Window CNN encoder with an autoregressive transformer decoder.
///
/// The encoder turns a line into one `tf_dim` feature vector per window,
/// which the decoder attends over while emitting characters one at a time.
#[derive(Debug)]
pub struct LineCnnTransformer {
    cnn: WindowCnn,
    encoder: SlidingWindowEncoder,
    pe_2d: PositionalEncoding2d,
    embedding: Embedding,
    pe_1d: PositionalEncoding1d,
    decoder: TransformerDecoder,
    fc: Linear,
    masks: MaskCache,
    config: LineCnnTransformerConfig,
    start_index: u32,
    end_index: u32,
    padding_index: u32,
    device: Device,
}

impl LineCnnTransformer {
    /// Builds the model with weights taken from `vb`.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when the configuration is invalid or its
    /// `num_classes` differs from the size of `mapping`.
    pub fn new(
        config: LineCnnTransformerConfig,
        mapping: &CharacterMapping,
        vb: VarBuilder,
    ) -> RecResult<Self> {
        config.validate()?;
        if config.num_classes != mapping.len() {
            return Err(RecognitionError::invalid_configuration(format!(
                "num_classes {} does not match the mapping size {}",
                config.num_classes,
                mapping.len()
            )));
        }
        let device = vb.device().clone();
        let dim = config.tf_dim;

        let cnn = WindowCnn::new(config.cnn_config(), config.seed, vb.pp("line_cnn"))?;
        let encoder = SlidingWindowEncoder::new(
            config.window_width,
            config.window_stride,
            config.input_height,
            None,
        )?
        .with_execution(config.execution);
        let pe_2d = PositionalEncoding2d::new(
            dim,
            config.max_feature_height,
            config.max_feature_width,
            &device,
        )?;

        let init = Init::Uniform {
            lo: -INIT_RANGE,
            up: INIT_RANGE,
        };
        let embedding_weight = vb
            .pp("embedding")
            .get_with_hints((config.num_classes, dim), "weight", init)
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "load embedding", e))?;
        let embedding = Embedding::new(embedding_weight, dim);

        let pe_1d = PositionalEncoding1d::new(
            dim,
            config.max_sequence_length,
            config.tf_dropout,
            config.seed.wrapping_add(2),
            &device,
        )?;
        let decoder = TransformerDecoder::new(
            DecoderLayerSpec {
                d_model: dim,
                num_heads: config.tf_nhead,
                ff_dim: config.tf_fc_dim,
                dropout: config.tf_dropout,
            },
            config.tf_layers,
            config.seed.wrapping_add(16),
            vb.pp("decoder"),
        )?;

        let fc_weight = vb
            .pp("fc")
            .get_with_hints((config.num_classes, dim), "weight", init)
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "load fc weight", e))?;
        let fc_bias = vb
            .pp("fc")
            .get_with_hints(config.num_classes, "bias", Init::Const(0.0))
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "load fc bias", e))?;
        let fc = Linear::new(fc_weight, Some(fc_bias));

        tracing::info!(
            "LineCnnTransformer: dim {}, {} heads, {} layers, {} classes, max output {}",
            dim,
            config.tf_nhead,
            config.tf_layers,
            config.num_classes,
            config.max_output_length
        );

        Ok(Self {
            cnn,
            encoder,
            pe_2d,
            embedding,
            pe_1d,
            decoder,
            fc,
            masks: MaskCache::with_capacity(&device, config.max_output_length),
            start_index: mapping.start_index(),
            end_index: mapping.end_index(),
            padding_index: mapping.padding_index(),
            config,
            device,
        })
    }

    /// Loads weights from a safetensors file.
    pub fn from_safetensors(
        config: LineCnnTransformerConfig,
        mapping: &CharacterMapping,
        weights: impl AsRef<Path>,
        device: &Device,
    ) -> RecResult<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.as_ref()], DType::F32, device)
                .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "load safetensors", e))?
        };
        Self::new(config, mapping, vb)
    }

    pub fn config(&self) -> &LineCnnTransformerConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Encodes a `(B, 1, H, W)` image into `(B, S, tf_dim)` memory.
    ///
    /// Window features are scaled by `sqrt(tf_dim)`, viewed as a one-row
    /// feature map and given the 2-D positional encoding.
    pub fn encode(&self, x: &Tensor, mode: Mode) -> RecResult<Tensor> {
        let features = self.encoder.encode(x, &self.cnn, mode)?;
        let scale = (self.config.tf_dim as f64).sqrt();
        let map = (features * scale)
            .and_then(|f| f.unsqueeze(2))
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "scale features", e))?;
        let map = self.pe_2d.apply(&map)?;
        map.squeeze(2)
            .and_then(|m| m.transpose(1, 2))
            .and_then(|m| m.contiguous())
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "flatten memory", e))
    }

    /// Decodes `(B, Sy)` token ids against `memory`, returning
    /// `(B, Sy, num_classes)` logits.
    pub fn decode(&self, memory: &Tensor, y: &Tensor, mode: Mode) -> RecResult<Tensor> {
        let scale = (self.config.tf_dim as f64).sqrt();
        // (B, Sy, E) -> (Sy, B, E) for the sequence-major positional table
        let embedded = self
            .embedding
            .forward(y)
            .and_then(|e| e * scale)
            .and_then(|e| e.transpose(0, 1))
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "embed tokens", e))?;
        let embedded = self
            .pe_1d
            .apply(&embedded, mode)?
            .transpose(0, 1)
            .and_then(|e| e.contiguous())
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "transpose tokens", e))?;

        let mask = self.target_mask(y)?;
        let hidden = self.decoder.forward(&embedded, memory, Some(&mask), mode)?;
        self.fc
            .forward(&hidden)
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "fc", e))
    }

    /// Causal mask combined with a key mask over padding tokens, `(B, 1, Sy, Sy)`.
    ///
    /// Position 0 always stays visible so no attention row is fully masked.
    fn target_mask(&self, y: &Tensor) -> RecResult<Tensor> {
        let (batch, length) = y
            .dims2()
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "target shape", e))?;
        let causal = self.masks.get(length)?;

        let ids = tokens_to_vec(y)?;
        let padding: Vec<f32> = ids
            .iter()
            .flat_map(|row| {
                row.iter().enumerate().map(|(j, &id)| {
                    if j > 0 && id == self.padding_index {
                        f32::NEG_INFINITY
                    } else {
                        0.0
                    }
                })
            })
            .collect();

        Tensor::from_vec(padding, (batch, 1, 1, length), &self.device)
            .and_then(|p| causal.broadcast_add(&p))
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "build target mask", e))
    }

    /// Teacher-forced logits, `(B, num_classes, Sy)`.
    pub fn forward(&self, x: &Tensor, y: &Tensor, mode: Mode) -> RecResult<Tensor> {
        let memory = self.encode(x, mode)?;
        self.decode(&memory, y, mode)?
            .permute((0, 2, 1))
            .and_then(|l| l.contiguous())
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "permute logits", e))
    }

    /// Greedy decoding.
    ///
    /// Every row starts with `<S>` and has `max_output_length` tokens. Decoding
    /// stops early once every row has produced `<E>` or `<P>`, and every token
    /// after the first `<E>` is replaced by `<P>`.
    pub fn predict(&self, x: &Tensor) -> RecResult<Vec<Vec<u32>>> {
        let memory = self.encode(x, Mode::Eval)?;
        let batch = memory
            .dims3()
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "memory shape", e))?
            .0;
        let max_len = self.config.max_output_length;

        let mut tokens = vec![vec![self.padding_index; max_len]; batch];
        for row in &mut tokens {
            row[0] = self.start_index;
        }

        let mut finished = vec![false; batch];
        for step in 1..max_len {
            let prefix: Vec<u32> = tokens
                .iter()
                .flat_map(|row| row[..step].iter().copied())
                .collect();
            let y = Tensor::from_vec(prefix, (batch, step), &self.device)
                .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "prefix tensor", e))?;
            let logits = self.decode(&memory, &y, Mode::Eval)?;
            let last = logits
                .i((.., step - 1, ..))
                .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "last logits", e))?;
            let next = argmax_last(&last)?;

            for ((row, done), &token) in tokens.iter_mut().zip(finished.iter_mut()).zip(&next) {
                row[step] = token;
                *done |= token == self.end_index || token == self.padding_index;
            }
            if finished.iter().all(|&done| done) {
                tracing::debug!("all sequences finished after {} steps", step);
                break;
            }
        }

        pad_after_end(&mut tokens, self.end_index, self.padding_index);
        Ok(tokens)
    }
}

/// Replaces every token that follows `<E>` or `<P>` with `<P>`.
fn pad_after_end(tokens: &mut [Vec<u32>], end_index: u32, padding_index: u32) {
    for row in tokens {
        for s in 1..row.len() {
            if row[s - 1] == end_index || row[s - 1] == padding_index {
                row[s] = padding_index;
            }
        }
    }
}

impl SequenceModel for LineCnnTransformer {
    fn name(&self) -> &str {
        "LineCnnTransformer"
    }

    /// Feeds `y[:, :-1]` and scores the prediction against `y[:, 1:]`.
    fn training_logits(&self, x: &Tensor, y: &Tensor, mode: Mode) -> RecResult<(Tensor, Tensor)> {
        let length = y
            .dims2()
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "target shape", e))?
            .1;
        if length < 2 {
            return Err(RecognitionError::invalid_input(format!(
                "targets need at least <S> and one more token, got length {}",
                length
            )));
        }
        let shift = || -> candle_core::Result<(Tensor, Tensor)> {
            let inputs = y.narrow(1, 0, length - 1)?.contiguous()?;
            let targets = y.narrow(1, 1, length - 1)?.contiguous()?;
            Ok((inputs, targets))
        };
        let (inputs, targets) = shift()
            .map_err(|e| candle_to_rec_inference("LineCnnTransformer", "shift targets", e))?;
        let logits = self.forward(x, &inputs, mode)?;
        Ok((logits, targets))
    }

    fn predict(&self, x: &Tensor) -> RecResult<Vec<Vec<u32>>> {
        LineCnnTransformer::predict(self, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn mapping() -> CharacterMapping {
        CharacterMapping::new("ab".chars())
    }

    fn tiny_config() -> LineCnnTransformerConfig {
        LineCnnTransformerConfig {
            window_width: 8,
            window_stride: 8,
            input_height: 8,
            conv_dim: 2,
            fc_dim: 8,
            tf_dim: 8,
            tf_fc_dim: 16,
            tf_nhead: 2,
            tf_layers: 1,
            max_output_length: 6,
            num_classes: 6,
            max_feature_width: 16,
            ..LineCnnTransformerConfig::default()
        }
    }

    fn build(config: LineCnnTransformerConfig) -> RecResult<LineCnnTransformer> {
        let varmap = VarMap::new();
        LineCnnTransformer::new(
            config,
            &mapping(),
            VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
        )
    }

    #[test]
    fn test_forward_shape() -> RecResult<()> {
        let model = build(tiny_config())?;
        let x = Tensor::rand(0f32, 1., (2, 1, 8, 32), &Device::Cpu).unwrap();
        let y = Tensor::new(&[[1u32, 4, 5, 2], [1, 5, 2, 3]], &Device::Cpu).unwrap();

        let memory = model.encode(&x, Mode::Eval)?;
        assert_eq!(memory.dims(), &[2, 4, 8]);

        let logits = model.forward(&x, &y, Mode::Eval)?;
        assert_eq!(logits.dims(), &[2, 6, 4]);
        let logits = model.forward(&x, &y, Mode::Train)?;
        assert_eq!(logits.dims(), &[2, 6, 4]);
        Ok(())
    }

    #[test]
    fn test_forward_accepts_i64_targets() -> RecResult<()> {
        let model = build(tiny_config())?;
        let x = Tensor::rand(0f32, 1., (1, 1, 8, 32), &Device::Cpu).unwrap();
        let wide = Tensor::new(&[[1i64, 4, 5, 2]], &Device::Cpu).unwrap();
        let narrow = Tensor::new(&[[1u32, 4, 5, 2]], &Device::Cpu).unwrap();

        let from_wide = model.forward(&x, &wide, Mode::Eval)?;
        assert_eq!(from_wide.dims(), &[1, 6, 4]);
        let from_narrow = model.forward(&x, &narrow, Mode::Eval)?;
        assert_eq!(
            from_wide.to_vec3::<f32>().unwrap(),
            from_narrow.to_vec3::<f32>().unwrap()
        );

        // Padding in an I64 batch is still masked out of the keys
        let padded = Tensor::new(&[[1i64, 4, 2, 3, 3]], &Device::Cpu).unwrap();
        let (logits, targets) = model.training_logits(&x, &padded, Mode::Eval)?;
        assert_eq!(logits.dims(), &[1, 6, 4]);
        assert_eq!(targets.dims(), &[1, 4]);
        Ok(())
    }

    #[test]
    fn test_predict_shape_and_structure() -> RecResult<()> {
        let model = build(tiny_config())?;
        let x = Tensor::rand(0f32, 1., (3, 1, 8, 24), &Device::Cpu).unwrap();
        let predictions = model.predict(&x)?;
        assert_eq!(predictions.len(), 3);
        for row in &predictions {
            assert_eq!(row.len(), 6);
            assert_eq!(row[0], 1);
            if let Some(end) = row.iter().position(|&t| t == 2 || t == 3) {
                assert!(row[end + 1..].iter().all(|&t| t == 3));
            }
        }
        Ok(())
    }

    #[test]
    fn test_pad_after_end() {
        let mut tokens = vec![
            vec![1, 4, 2, 5, 4, 4],
            vec![1, 5, 5, 3, 4, 2],
            vec![1, 4, 4, 4, 4, 4],
        ];
        pad_after_end(&mut tokens, 2, 3);
        assert_eq!(tokens[0], vec![1, 4, 2, 3, 3, 3]);
        assert_eq!(tokens[1], vec![1, 5, 5, 3, 3, 3]);
        assert_eq!(tokens[2], vec![1, 4, 4, 4, 4, 4]);
    }

    #[test]
    fn test_mapping_size_must_match() {
        let config = LineCnnTransformerConfig {
            num_classes: 9,
            ..tiny_config()
        };
        assert!(matches!(
            build(config),
            Err(RecognitionError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_too_many_windows_for_positional_table() -> RecResult<()> {
        let model = build(LineCnnTransformerConfig {
            max_feature_width: 2,
            ..tiny_config()
        })?;
        let x = Tensor::rand(0f32, 1., (1, 1, 8, 24), &Device::Cpu).unwrap();
        assert!(matches!(
            model.encode(&x, Mode::Eval),
            Err(RecognitionError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_target_longer_than_positional_table() -> RecResult<()> {
        let model = build(LineCnnTransformerConfig {
            max_sequence_length: 6,
            ..tiny_config()
        })?;
        let x = Tensor::rand(0f32, 1., (1, 1, 8, 16), &Device::Cpu).unwrap();
        let y = Tensor::new(&[[1u32, 4, 4, 4, 4, 4, 2]], &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&x, &y, Mode::Eval),
            Err(RecognitionError::DimensionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_training_logits_shift() -> RecResult<()> {
        let model = build(tiny_config())?;
        let x = Tensor::rand(0f32, 1., (1, 1, 8, 16), &Device::Cpu).unwrap();
        let y = Tensor::new(&[[1u32, 4, 5, 2, 3]], &Device::Cpu).unwrap();
        let (logits, targets) = model.training_logits(&x, &y, Mode::Eval)?;
        assert_eq!(logits.dims(), &[1, 6, 4]);
        assert_eq!(targets.to_vec2::<u32>().unwrap(), vec![vec![4, 5, 2, 3]]);

        let too_short = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        assert!(model.training_logits(&x, &too_short, Mode::Eval).is_err());
        Ok(())
    }
}
