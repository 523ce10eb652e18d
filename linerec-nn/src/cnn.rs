//! Per-window feature extraction.
//!
//! [`FeatureExtractor`] is the seam between the sliding-window encoder and
//! whatever network classifies a single window. [`WindowCnn`] is the
//! convolutional implementation used by both line models.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder};
use linerec_core::ConfigValidator;
use linerec_core::core::config::ConfigValidator;
use linerec_core::core::constants::{
    DEFAULT_CNN_DROPOUT, DEFAULT_CONV_DIM, DEFAULT_FC_DIM, DEFAULT_NUM_CLASSES, DEFAULT_WINDOW_WIDTH,
    IMAGE_SIZE,
};
use linerec_core::core::RecResult;
use linerec_core::core::validation::{validate_axis, validate_tensor_shape};
use serde::{Deserialize, Serialize};

use crate::dropout::{Dropout, Mode};
use crate::utils::candle_to_rec_inference;

/// Maps one `(B, C, H, WW)` window to a `(B, K)` feature vector.
///
/// Implementations must be pure with respect to the window: the output for
/// a window may not depend on any other window of the same image.
pub trait FeatureExtractor: Send + Sync {
    /// Runs the extractor over a batch of windows.
    fn extract(&self, window: &Tensor, mode: Mode) -> RecResult<Tensor>;

    /// Size `K` of the produced feature vector.
    fn output_dim(&self) -> usize;
}

/// Shape parameters of [`WindowCnn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ConfigValidator)]
pub struct CnnConfig {
    #[validate(min = 1)]
    pub input_channels: usize,
    /// Window height; must match the line height.
    #[validate(min = 2)]
    pub input_height: usize,
    #[validate(min = 2)]
    pub window_width: usize,
    #[validate(min = 1)]
    pub conv_dim: usize,
    #[validate(min = 1)]
    pub fc_dim: usize,
    /// Size of the per-window output.
    #[validate(min = 1)]
    pub output_dim: usize,
    #[validate(range(min = 0.0, max = 0.95))]
    pub dropout: f32,
}

impl Default for CnnConfig {
    fn default() -> Self {
        Self {
            input_channels: 1,
            input_height: IMAGE_SIZE,
            window_width: DEFAULT_WINDOW_WIDTH,
            conv_dim: DEFAULT_CONV_DIM,
            fc_dim: DEFAULT_FC_DIM,
            output_dim: DEFAULT_NUM_CLASSES,
            dropout: DEFAULT_CNN_DROPOUT,
        }
    }
}

impl CnnConfig {
    /// Number of features entering the first linear layer.
    ///
    /// The two padded 3x3 convolutions keep the spatial size and the 2x2
    /// max-pool halves it, flooring odd sizes.
    pub fn flattened_dim(&self) -> usize {
        self.conv_dim * (self.input_height / 2) * (self.window_width / 2)
    }
}

/// Two 3x3 convolutions, a 2x2 max-pool and two linear layers.
///
/// ```text
/// conv3x3 -> relu -> conv3x3 -> relu -> maxpool2 -> dropout
///   -> flatten -> fc1 -> relu -> dropout -> fc2
/// ```
#[derive(Debug)]
pub struct WindowCnn {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    dropout1: Dropout,
    dropout2: Dropout,
    config: CnnConfig,
}

impl WindowCnn {
    /// Builds the network under `vb`.
    ///
    /// `seed` drives the two dropout layers.
    pub fn new(config: CnnConfig, seed: u64, vb: VarBuilder) -> RecResult<Self> {
        config.validate()?;

        let conv_cfg = Conv2dConfig {
            padding: 1,
            stride: 1,
            dilation: 1,
            groups: 1,
            cudnn_fwd_algo: None,
        };
        let conv1 = candle_nn::conv2d(
            config.input_channels,
            config.conv_dim,
            3,
            conv_cfg,
            vb.pp("conv1"),
        )
        .map_err(|e| candle_to_rec_inference("WindowCnn", "load conv1", e))?;
        let conv2 = candle_nn::conv2d(config.conv_dim, config.conv_dim, 3, conv_cfg, vb.pp("conv2"))
            .map_err(|e| candle_to_rec_inference("WindowCnn", "load conv2", e))?;
        let fc1 = candle_nn::linear(config.flattened_dim(), config.fc_dim, vb.pp("fc1"))
            .map_err(|e| candle_to_rec_inference("WindowCnn", "load fc1", e))?;
        let fc2 = candle_nn::linear(config.fc_dim, config.output_dim, vb.pp("fc2"))
            .map_err(|e| candle_to_rec_inference("WindowCnn", "load fc2", e))?;

        Ok(Self {
            conv1,
            conv2,
            fc1,
            fc2,
            dropout1: Dropout::new(config.dropout, seed)?,
            dropout2: Dropout::new(config.dropout, seed.wrapping_add(1))?,
            config,
        })
    }

    pub fn config(&self) -> &CnnConfig {
        &self.config
    }

    fn check_window(&self, window: &Tensor) -> RecResult<()> {
        let dims = window.dims();
        validate_tensor_shape(dims, 4, "WindowCnn window (B, C, H, W)")?;
        validate_axis(dims, 1, self.config.input_channels, "WindowCnn channels")?;
        validate_axis(dims, 2, self.config.input_height, "WindowCnn height")?;
        validate_axis(dims, 3, self.config.window_width, "WindowCnn width")
    }
}

impl FeatureExtractor for WindowCnn {
    fn extract(&self, window: &Tensor, mode: Mode) -> RecResult<Tensor> {
        self.check_window(window)?;

        let features = self
            .conv1
            .forward(window)
            .and_then(|x| x.relu())
            .and_then(|x| self.conv2.forward(&x))
            .and_then(|x| x.relu())
            .and_then(|x| x.max_pool2d(2))
            .map_err(|e| candle_to_rec_inference("WindowCnn", "convolutions", e))?;
        let features = self.dropout1.forward(&features, mode)?;

        let hidden = features
            .flatten_from(1)
            .and_then(|x| self.fc1.forward(&x))
            .and_then(|x| x.relu())
            .map_err(|e| candle_to_rec_inference("WindowCnn", "fc1", e))?;
        let hidden = self.dropout2.forward(&hidden, mode)?;

        self.fc2
            .forward(&hidden)
            .map_err(|e| candle_to_rec_inference("WindowCnn", "fc2", e))
    }

    fn output_dim(&self) -> usize {
        self.config.output_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use linerec_core::core::RecognitionError;

    fn small_config() -> CnnConfig {
        CnnConfig {
            input_channels: 1,
            input_height: 8,
            window_width: 6,
            conv_dim: 4,
            fc_dim: 16,
            output_dim: 5,
            dropout: 0.25,
        }
    }

    #[test]
    fn test_flattened_dim() {
        assert_eq!(small_config().flattened_dim(), 4 * 4 * 3);
        assert_eq!(CnnConfig::default().flattened_dim(), 64 * 14 * 14);
    }

    #[test]
    fn test_extract_shape() -> RecResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let cnn = WindowCnn::new(
            small_config(),
            0,
            VarBuilder::from_varmap(&varmap, DType::F32, &device),
        )?;
        let window = Tensor::rand(0f32, 1., (3, 1, 8, 6), &device).unwrap();
        let out = cnn.extract(&window, Mode::Eval)?;
        assert_eq!(out.dims(), &[3, 5]);
        assert_eq!(cnn.output_dim(), 5);

        // Eval is deterministic
        let again = cnn.extract(&window, Mode::Eval)?;
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            again.to_vec2::<f32>().unwrap()
        );
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_window() -> RecResult<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let cnn = WindowCnn::new(
            small_config(),
            0,
            VarBuilder::from_varmap(&varmap, DType::F32, &device),
        )?;
        let too_wide = Tensor::zeros((1, 1, 8, 7), DType::F32, &device).unwrap();
        assert!(matches!(
            cnn.extract(&too_wide, Mode::Eval),
            Err(RecognitionError::DimensionMismatch { .. })
        ));
        let flat = Tensor::zeros((1, 8, 6), DType::F32, &device).unwrap();
        assert!(matches!(
            cnn.extract(&flat, Mode::Eval),
            Err(RecognitionError::InvalidInput { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = CnnConfig {
            conv_dim: 0,
            ..small_config()
        };
        assert!(WindowCnn::new(config, 0, vb).is_err());
    }
}
