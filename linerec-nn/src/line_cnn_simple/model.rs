use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use linerec_core::core::config::ConfigValidator;
use linerec_core::core::RecResult;
use std::path::Path;

use super::config::LineCnnSimpleConfig;
use crate::cnn::WindowCnn;
use crate::dropout::Mode;
use crate::sliding_window::SlidingWindowEncoder;
use crate::training::SequenceModel;
use crate::utils::{argmax_classes, candle_to_rec_inference};

/// Classifies every window of a line independently.
///
/// The output has one position per window, so the window geometry decides
/// how many characters the model can emit.
#[derive(Debug)]
pub struct LineCnnSimple {
    cnn: WindowCnn,
    encoder: SlidingWindowEncoder,
    config: LineCnnSimpleConfig,
}

impl LineCnnSimple {
    /// Builds the model with weights taken from `vb`.
    pub fn new(config: LineCnnSimpleConfig, vb: VarBuilder) -> RecResult<Self> {
        config.validate()?;
        let cnn = WindowCnn::new(config.cnn_config(), config.seed, vb.pp("cnn"))?;
        let encoder = SlidingWindowEncoder::new(
            config.window_width,
            config.window_stride,
            config.input_height,
            config.output_length_limit(),
        )?
        .with_execution(config.execution);

        tracing::info!(
            "LineCnnSimple: window {}x{} stride {}, {} classes",
            config.input_height,
            config.window_width,
            config.window_stride,
            config.num_classes
        );
        Ok(Self {
            cnn,
            encoder,
            config,
        })
    }

    /// Loads weights from a safetensors file.
    pub fn from_safetensors(
        config: LineCnnSimpleConfig,
        weights: impl AsRef<Path>,
        device: &Device,
    ) -> RecResult<Self> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.as_ref()], DType::F32, device)
                .map_err(|e| candle_to_rec_inference("LineCnnSimple", "load safetensors", e))?
        };
        Self::new(config, vb)
    }

    pub fn config(&self) -> &LineCnnSimpleConfig {
        &self.config
    }

    pub fn encoder(&self) -> &SlidingWindowEncoder {
        &self.encoder
    }

    /// Computes `(B, num_classes, S)` logits for a `(B, 1, H, W)` image.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> RecResult<Tensor> {
        self.encoder.encode(x, &self.cnn, mode)
    }

    /// Most likely class per window, `(B, S)`.
    pub fn predict(&self, x: &Tensor) -> RecResult<Vec<Vec<u32>>> {
        let logits = self.forward(x, Mode::Eval)?;
        argmax_classes(&logits)
    }
}

impl SequenceModel for LineCnnSimple {
    fn name(&self) -> &str {
        "LineCnnSimple"
    }

    /// Every window is scored against the label at the same position.
    fn training_logits(&self, x: &Tensor, y: &Tensor, mode: Mode) -> RecResult<(Tensor, Tensor)> {
        let logits = self.forward(x, mode)?;
        Ok((logits, y.clone()))
    }

    fn predict(&self, x: &Tensor) -> RecResult<Vec<Vec<u32>>> {
        LineCnnSimple::predict(self, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sliding_window::WindowExecution;
    use candle_nn::VarMap;
    use linerec_core::core::RecognitionError;

    fn small_config() -> LineCnnSimpleConfig {
        LineCnnSimpleConfig {
            window_width: 8,
            window_stride: 8,
            input_height: 8,
            conv_dim: 4,
            fc_dim: 16,
            num_classes: 7,
            max_output_length: 3,
            ..LineCnnSimpleConfig::default()
        }
    }

    fn build(config: LineCnnSimpleConfig) -> RecResult<LineCnnSimple> {
        let varmap = VarMap::new();
        LineCnnSimple::new(
            config,
            VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
        )
    }

    #[test]
    fn test_forward_shape_follows_windows() -> RecResult<()> {
        let model = build(small_config())?;
        let x = Tensor::rand(0f32, 1., (2, 1, 8, 40), &Device::Cpu).unwrap();
        let logits = model.forward(&x, Mode::Eval)?;
        assert_eq!(logits.dims(), &[2, 7, 5]);

        let predictions = model.predict(&x)?;
        assert_eq!(predictions.len(), 2);
        assert!(predictions.iter().all(|p| p.len() == 5));
        assert!(predictions.iter().flatten().all(|&c| c < 7));
        Ok(())
    }

    #[test]
    fn test_limit_output_length() -> RecResult<()> {
        let model = build(LineCnnSimpleConfig {
            limit_output_length: true,
            ..small_config()
        })?;
        let x = Tensor::rand(0f32, 1., (1, 1, 8, 40), &Device::Cpu).unwrap();
        assert_eq!(model.forward(&x, Mode::Eval)?.dims(), &[1, 7, 3]);
        Ok(())
    }

    #[test]
    fn test_batched_matches_sequential() -> RecResult<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let sequential = LineCnnSimple::new(small_config(), vb.clone())?;
        // Same varmap, so both models share weights
        let batched = LineCnnSimple::new(
            LineCnnSimpleConfig {
                execution: WindowExecution::Batched,
                ..small_config()
            },
            vb,
        )?;
        let x = Tensor::rand(0f32, 1., (2, 1, 8, 32), &Device::Cpu).unwrap();
        let a: Vec<Vec<Vec<f32>>> = sequential.forward(&x, Mode::Eval)?.to_vec3().unwrap();
        let b: Vec<Vec<Vec<f32>>> = batched.forward(&x, Mode::Eval)?.to_vec3().unwrap();
        for (x, y) in a.iter().flatten().flatten().zip(b.iter().flatten().flatten()) {
            assert!((x - y).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_parallel_training_dropout_is_seeded() -> RecResult<()> {
        let config = LineCnnSimpleConfig {
            execution: WindowExecution::Parallel,
            dropout: 0.5,
            seed: 11,
            ..small_config()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let x = Tensor::rand(0f32, 1., (2, 1, 8, 400), &Device::Cpu).unwrap();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(8)
            .build()
            .unwrap();

        for _ in 0..5 {
            // Fresh models restart the dropout streams from the seed
            let a = LineCnnSimple::new(config.clone(), vb.clone())?;
            let b = LineCnnSimple::new(config.clone(), vb.clone())?;
            for _ in 0..4 {
                let out_a = pool.install(|| a.forward(&x, Mode::Train))?;
                let out_b = pool.install(|| b.forward(&x, Mode::Train))?;
                assert_eq!(
                    out_a.to_vec3::<f32>().unwrap(),
                    out_b.to_vec3::<f32>().unwrap()
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_wrong_height_fails_fast() -> RecResult<()> {
        let model = build(small_config())?;
        let x = Tensor::zeros((1, 1, 28, 40), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&x, Mode::Eval),
            Err(RecognitionError::InvalidGeometry { .. })
        ));
        Ok(())
    }
}
