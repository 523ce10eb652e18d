//! Training and evaluation loop pieces.
//!
//! The [`Trainer`] owns a model, the [`VarMap`] holding its weights and an
//! AdamW optimizer. Batches are driven by the caller; the trainer runs one
//! step per call and accumulates character error rates across an epoch.

use candle_core::{D, DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use linerec_core::ConfigValidator;
use linerec_core::core::config::ConfigValidator;
use linerec_core::core::errors::ProcessingStage;
use linerec_core::core::{RecResult, RecognitionError};
use linerec_core::domain::CharacterMapping;
use linerec_core::metrics::CharacterErrorRate;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::dropout::Mode;
use crate::utils::{candle_to_rec_processing, tokens_to_vec};

/// A model the [`Trainer`] can fit.
pub trait SequenceModel: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Logits `(B, K, S)` for a batch together with the `(B, S)` class ids
    /// they are scored against.
    fn training_logits(&self, x: &Tensor, y: &Tensor, mode: Mode) -> RecResult<(Tensor, Tensor)>;

    /// Decoded class ids per batch entry.
    fn predict(&self, x: &Tensor) -> RecResult<Vec<Vec<u32>>>;
}

/// Cross-entropy over `(B, K, S)` logits that skips `ignore_index` targets.
///
/// The loss is the mean negative log-likelihood over the positions whose
/// target differs from `ignore_index`.
///
/// # Errors
///
/// * `DimensionMismatch` when `targets` is not `(B, S)`.
/// * `InvalidInput` when a target is out of range or every target is ignored.
pub fn masked_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    ignore_index: u32,
) -> RecResult<Tensor> {
    let err = |context: &'static str| {
        move |e: candle_core::Error| {
            candle_to_rec_processing(ProcessingStage::TensorOperation, context, e)
        }
    };

    let (batch, classes, length) = logits.dims3().map_err(err("logits shape"))?;
    let target_dims = targets.dims();
    if target_dims.len() != 2 {
        return Err(RecognitionError::dimension_mismatch(
            "cross-entropy target rank",
            2,
            target_dims.len(),
        ));
    }
    if target_dims[0] != batch {
        return Err(RecognitionError::dimension_mismatch(
            "cross-entropy target batch",
            batch,
            target_dims[0],
        ));
    }
    if target_dims[1] != length {
        return Err(RecognitionError::dimension_mismatch(
            "cross-entropy target length",
            length,
            target_dims[1],
        ));
    }

    let flat_targets = targets
        .to_dtype(DType::U32)
        .and_then(|t| t.flatten_all())
        .map_err(err("flatten targets"))?;
    let ids = flat_targets.to_vec1::<u32>().map_err(err("read targets"))?;
    if let Some(bad) = ids
        .iter()
        .find(|&&id| id != ignore_index && id as usize >= classes)
    {
        return Err(RecognitionError::invalid_input(format!(
            "target class {} is out of range for {} classes",
            bad, classes
        )));
    }

    let weights: Vec<f32> = ids
        .iter()
        .map(|&id| if id == ignore_index { 0.0 } else { 1.0 })
        .collect();
    let counted = weights.iter().filter(|&&w| w > 0.0).count();
    if counted == 0 {
        return Err(RecognitionError::invalid_input(
            "every target position is ignored",
        ));
    }
    // Ignored ids may lie outside [0, K); gather them at class 0 instead
    let safe_ids: Vec<u32> = ids
        .iter()
        .map(|&id| if id == ignore_index { 0 } else { id })
        .collect();

    let device = logits.device();
    let compute = || -> candle_core::Result<Tensor> {
        // (B, K, S) -> (B * S, K)
        let log_probs = logits
            .permute((0, 2, 1))?
            .contiguous()?
            .reshape((batch * length, classes))?;
        let log_probs = candle_nn::ops::log_softmax(&log_probs, D::Minus1)?;
        let index = Tensor::from_vec(safe_ids, (batch * length, 1), device)?;
        let picked = log_probs.gather(&index, 1)?.squeeze(1)?;
        let weights = Tensor::from_vec(weights, batch * length, device)?.to_dtype(picked.dtype())?;
        (picked * weights)?.sum_all()?.neg()? / counted as f64
    };
    compute().map_err(err("cross-entropy"))
}

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ConfigValidator)]
#[serde(default)]
pub struct TrainerConfig {
    #[validate(range(min = 1e-8, max = 1.0))]
    pub learning_rate: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub weight_decay: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 0.01,
        }
    }
}

/// Loss and character error rate of one validation batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub loss: f32,
    pub cer: f64,
}

/// Fits a [`SequenceModel`] whose weights live in a [`VarMap`].
pub struct Trainer<M: SequenceModel> {
    model: M,
    varmap: VarMap,
    optimizer: AdamW,
    padding_index: u32,
    ignore_tokens: [u32; 3],
    val_cer: CharacterErrorRate,
    test_cer: CharacterErrorRate,
    steps: usize,
}

impl<M: SequenceModel> Trainer<M> {
    /// Creates a trainer optimizing every variable of `varmap`.
    ///
    /// `model` must have been built from a `VarBuilder` over the same
    /// `varmap`, otherwise its weights are not updated.
    pub fn new(
        model: M,
        varmap: VarMap,
        mapping: &CharacterMapping,
        config: TrainerConfig,
    ) -> RecResult<Self> {
        config.validate()?;
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params).map_err(|e| {
            candle_to_rec_processing(ProcessingStage::Generic, "create optimizer", e)
        })?;
        let ignore_tokens = mapping.ignore_tokens();

        tracing::info!(
            "{} trainer: {} variables, lr {}",
            model.name(),
            varmap.all_vars().len(),
            config.learning_rate
        );
        Ok(Self {
            model,
            varmap,
            optimizer,
            padding_index: mapping.padding_index(),
            ignore_tokens,
            val_cer: CharacterErrorRate::new(ignore_tokens),
            test_cer: CharacterErrorRate::new(ignore_tokens),
            steps: 0,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Number of optimizer steps taken so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Runs one optimizer step on a batch and returns its loss.
    pub fn training_step(&mut self, x: &Tensor, y: &Tensor) -> RecResult<f32> {
        let (logits, targets) = self.model.training_logits(x, y, Mode::Train)?;
        let loss = masked_cross_entropy(&logits, &targets, self.padding_index)?;
        self.optimizer.backward_step(&loss).map_err(|e| {
            candle_to_rec_processing(ProcessingStage::TensorOperation, "backward step", e)
        })?;
        self.steps += 1;

        let value = scalar(&loss)?;
        tracing::debug!("{} step {}: train_loss {:.4}", self.model.name(), self.steps, value);
        Ok(value)
    }

    /// Scores a validation batch and adds it to the epoch CER.
    pub fn validation_step(&mut self, x: &Tensor, y: &Tensor) -> RecResult<StepMetrics> {
        let (logits, targets) = self.model.training_logits(x, y, Mode::Eval)?;
        let loss = scalar(&masked_cross_entropy(&logits, &targets, self.padding_index)?)?;

        let predictions = self.model.predict(x)?;
        let expected = tokens_to_vec(y)?;
        let cer = self.batch_cer(&predictions, &expected)?;
        self.val_cer.update(&predictions, &expected)?;

        tracing::debug!("{} val_loss {:.4} val_cer {:.4}", self.model.name(), loss, cer);
        Ok(StepMetrics { loss, cer })
    }

    /// Scores a test batch, adds it to the epoch CER and returns the batch CER.
    pub fn test_step(&mut self, x: &Tensor, y: &Tensor) -> RecResult<f64> {
        let predictions = self.model.predict(x)?;
        let expected = tokens_to_vec(y)?;
        let cer = self.batch_cer(&predictions, &expected)?;
        self.test_cer.update(&predictions, &expected)?;
        Ok(cer)
    }

    /// Returns the validation CER of the finished epoch and starts a new one.
    pub fn end_validation_epoch(&mut self) -> f64 {
        let cer = self.val_cer.compute();
        tracing::info!(
            "{} validation: cer {:.4} over {} lines",
            self.model.name(),
            cer,
            self.val_cer.count()
        );
        self.val_cer.reset();
        cer
    }

    /// Returns the test CER accumulated so far and clears it.
    pub fn end_test_epoch(&mut self) -> f64 {
        let cer = self.test_cer.compute();
        tracing::info!(
            "{} test: cer {:.4} over {} lines",
            self.model.name(),
            cer,
            self.test_cer.count()
        );
        self.test_cer.reset();
        cer
    }

    /// Writes the weights to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> RecResult<()> {
        let path = path.as_ref();
        self.varmap.save(path).map_err(|e| {
            candle_to_rec_processing(ProcessingStage::Generic, "save weights", e)
        })?;
        tracing::info!("saved weights to {}", path.display());
        Ok(())
    }

    fn batch_cer(&self, predictions: &[Vec<u32>], expected: &[Vec<u32>]) -> RecResult<f64> {
        let mut cer = CharacterErrorRate::new(self.ignore_tokens);
        cer.update(predictions, expected)?;
        Ok(cer.compute())
    }
}

fn scalar(loss: &Tensor) -> RecResult<f32> {
    loss.to_dtype(DType::F32)
        .and_then(|l| l.to_scalar::<f32>())
        .map_err(|e| candle_to_rec_processing(ProcessingStage::TensorOperation, "read loss", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_cnn_simple::{LineCnnSimple, LineCnnSimpleConfig};
    use crate::line_cnn_transformer::{LineCnnTransformer, LineCnnTransformerConfig};
    use candle_core::Device;
    use candle_nn::VarBuilder;

    #[test]
    fn test_uniform_logits_give_log_k() -> RecResult<()> {
        let logits = Tensor::zeros((2, 5, 3), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1, 4], [2, 3, 1]], &Device::Cpu).unwrap();
        let loss = scalar(&masked_cross_entropy(&logits, &targets, 99)?)?;
        assert!((loss - 5f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_ignored_positions_do_not_count() -> RecResult<()> {
        let device = Device::Cpu;
        // One position strongly predicts class 0, the other class 1
        let logits = Tensor::new(&[[[5f32, -5.], [-5., 5.]]], &device)
            .unwrap()
            .transpose(1, 2)
            .unwrap();
        // Both predictions right: small loss
        let right = Tensor::new(&[[0u32, 1]], &device).unwrap();
        // Second position wrong but ignored: same loss as the first position alone
        let ignored = Tensor::new(&[[0u32, 3]], &device).unwrap();

        let both = scalar(&masked_cross_entropy(&logits, &right, 3)?)?;
        let first_only = scalar(&masked_cross_entropy(&logits, &ignored, 3)?)?;
        assert!(both < 0.01);
        assert!((both - first_only).abs() < 1e-5);

        let wrong = Tensor::new(&[[0u32, 0]], &device).unwrap();
        assert!(scalar(&masked_cross_entropy(&logits, &wrong, 3)?)? > 4.0);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_errors() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 4, 3), DType::F32, &device).unwrap();
        let short = Tensor::new(&[[0u32, 1]], &device).unwrap();
        assert!(matches!(
            masked_cross_entropy(&logits, &short, 3),
            Err(RecognitionError::DimensionMismatch { .. })
        ));
        let all_ignored = Tensor::new(&[[3u32, 3, 3]], &device).unwrap();
        assert!(matches!(
            masked_cross_entropy(&logits, &all_ignored, 3),
            Err(RecognitionError::InvalidInput { .. })
        ));
        let out_of_range = Tensor::new(&[[0u32, 9, 1]], &device).unwrap();
        assert!(matches!(
            masked_cross_entropy(&logits, &out_of_range, 3),
            Err(RecognitionError::InvalidInput { .. })
        ));
    }

    fn mapping() -> CharacterMapping {
        CharacterMapping::new("ab".chars())
    }

    #[test]
    fn test_simple_model_loss_decreases() -> RecResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = LineCnnSimpleConfig {
            window_width: 8,
            window_stride: 8,
            input_height: 8,
            conv_dim: 4,
            fc_dim: 16,
            dropout: 0.0,
            num_classes: mapping().len(),
            ..LineCnnSimpleConfig::default()
        };
        let model = LineCnnSimple::new(
            config,
            VarBuilder::from_varmap(&varmap, DType::F32, &device),
        )?;
        let mut trainer = Trainer::new(
            model,
            varmap,
            &mapping(),
            TrainerConfig {
                learning_rate: 1e-2,
                weight_decay: 0.0,
            },
        )?;

        let x = Tensor::rand(0f32, 1., (2, 1, 8, 32), &device).unwrap();
        let y = Tensor::new(&[[4u32, 5, 4, 5], [5, 4, 5, 4]], &device).unwrap();
        let first = trainer.training_step(&x, &y)?;
        let mut last = first;
        for _ in 0..30 {
            last = trainer.training_step(&x, &y)?;
        }
        assert_eq!(trainer.steps(), 31);
        assert!(last < first, "loss went from {first} to {last}");

        let metrics = trainer.validation_step(&x, &y)?;
        assert!(metrics.loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.cer));
        Ok(())
    }

    #[test]
    fn test_transformer_epoch_bookkeeping() -> RecResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let config = LineCnnTransformerConfig {
            window_width: 8,
            window_stride: 8,
            input_height: 8,
            conv_dim: 2,
            fc_dim: 8,
            tf_dim: 8,
            tf_fc_dim: 16,
            tf_nhead: 2,
            tf_layers: 1,
            max_output_length: 5,
            max_feature_width: 16,
            ..LineCnnTransformerConfig::for_mapping(&mapping())
        };
        let model = LineCnnTransformer::new(
            config,
            &mapping(),
            VarBuilder::from_varmap(&varmap, DType::F32, &device),
        )?;
        let mut trainer = Trainer::new(model, varmap, &mapping(), TrainerConfig::default())?;

        let x = Tensor::rand(0f32, 1., (2, 1, 8, 24), &device).unwrap();
        // <S> a b <E> <P> and <S> b <E> <P> <P>
        let y = Tensor::new(&[[1u32, 4, 5, 2, 3], [1, 5, 2, 3, 3]], &device).unwrap();

        let loss = trainer.training_step(&x, &y)?;
        assert!(loss.is_finite() && loss > 0.0);

        let metrics = trainer.validation_step(&x, &y)?;
        assert!(metrics.loss.is_finite());
        let epoch = trainer.end_validation_epoch();
        assert!((epoch - metrics.cer).abs() < 1e-12);
        // A fresh epoch starts empty
        assert_eq!(trainer.end_validation_epoch(), 0.0);

        let cer = trainer.test_step(&x, &y)?;
        assert!((trainer.end_test_epoch() - cer).abs() < 1e-12);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        trainer.save(&path)?;
        assert!(path.exists());
        Ok(())
    }
}
