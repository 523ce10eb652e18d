use linerec_core::core::config::{ConfigError, ConfigValidator, load_config};
use linerec_core::core::constants::{
    DEFAULT_CNN_DROPOUT, DEFAULT_CONV_DIM, DEFAULT_FC_DIM, DEFAULT_MAX_FEATURE_HEIGHT,
    DEFAULT_MAX_FEATURE_WIDTH, DEFAULT_MAX_OUTPUT_LENGTH, DEFAULT_MAX_SEQUENCE_LENGTH,
    DEFAULT_NUM_CLASSES, DEFAULT_TF_DIM, DEFAULT_TF_DROPOUT, DEFAULT_TF_FC_DIM, DEFAULT_TF_LAYERS,
    DEFAULT_TF_NHEAD, DEFAULT_WINDOW_STRIDE, DEFAULT_WINDOW_WIDTH, IMAGE_SIZE,
};
use linerec_core::core::RecResult;
use linerec_core::domain::CharacterMapping;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cnn::CnnConfig;
use crate::sliding_window::WindowExecution;

/// Hyper-parameters of [`LineCnnTransformer`](super::LineCnnTransformer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineCnnTransformerConfig {
    pub window_width: usize,
    pub window_stride: usize,
    pub input_height: usize,
    pub conv_dim: usize,
    pub fc_dim: usize,
    pub cnn_dropout: f32,
    /// Embedding depth shared by the encoder output and the decoder.
    pub tf_dim: usize,
    pub tf_fc_dim: usize,
    pub tf_nhead: usize,
    pub tf_layers: usize,
    pub tf_dropout: f32,
    /// Decoded sequence length, `<S>` and `<E>` included.
    pub max_output_length: usize,
    pub num_classes: usize,
    /// Row capacity of the 2-D positional table.
    pub max_feature_height: usize,
    /// Column capacity of the 2-D positional table, i.e. the most windows a
    /// line may produce.
    pub max_feature_width: usize,
    /// Position capacity of the 1-D positional table.
    pub max_sequence_length: usize,
    pub execution: WindowExecution,
    pub seed: u64,
}

impl Default for LineCnnTransformerConfig {
    fn default() -> Self {
        Self {
            window_width: DEFAULT_WINDOW_WIDTH,
            window_stride: DEFAULT_WINDOW_STRIDE,
            input_height: IMAGE_SIZE,
            conv_dim: DEFAULT_CONV_DIM,
            fc_dim: DEFAULT_FC_DIM,
            cnn_dropout: DEFAULT_CNN_DROPOUT,
            tf_dim: DEFAULT_TF_DIM,
            tf_fc_dim: DEFAULT_TF_FC_DIM,
            tf_nhead: DEFAULT_TF_NHEAD,
            tf_layers: DEFAULT_TF_LAYERS,
            tf_dropout: DEFAULT_TF_DROPOUT,
            max_output_length: DEFAULT_MAX_OUTPUT_LENGTH,
            num_classes: DEFAULT_NUM_CLASSES,
            max_feature_height: DEFAULT_MAX_FEATURE_HEIGHT,
            max_feature_width: DEFAULT_MAX_FEATURE_WIDTH,
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
            execution: WindowExecution::default(),
            seed: 0,
        }
    }
}

impl ConfigValidator for LineCnnTransformerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.validate_positive_usize(self.window_width, "window_width")?;
        self.validate_positive_usize(self.window_stride, "window_stride")?;
        self.validate_positive_usize(self.input_height, "input_height")?;
        self.validate_positive_usize(self.conv_dim, "conv_dim")?;
        self.validate_positive_usize(self.fc_dim, "fc_dim")?;
        self.validate_positive_usize(self.tf_dim, "tf_dim")?;
        self.validate_positive_usize(self.tf_fc_dim, "tf_fc_dim")?;
        self.validate_positive_usize(self.tf_nhead, "tf_nhead")?;
        self.validate_positive_usize(self.tf_layers, "tf_layers")?;
        self.validate_positive_usize(self.num_classes, "num_classes")?;
        self.validate_positive_usize(self.max_feature_height, "max_feature_height")?;
        self.validate_positive_usize(self.max_feature_width, "max_feature_width")?;
        self.validate_probability(self.cnn_dropout, "cnn_dropout")?;
        self.validate_probability(self.tf_dropout, "tf_dropout")?;

        if self.input_height < 2 || self.window_width < 2 {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "windows must be at least 2x2 pixels, got {}x{}",
                    self.input_height, self.window_width
                ),
            });
        }
        // The 2-D positional encoding splits the depth between rows and columns
        self.validate_divisible(self.tf_dim, 2, "tf_dim", "2")?;
        self.validate_divisible(self.tf_dim, self.tf_nhead, "tf_dim", "tf_nhead")?;

        if self.max_output_length < 2 {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "max_output_length must leave room for <S> and one token, got {}",
                    self.max_output_length
                ),
            });
        }
        if self.max_output_length > self.max_sequence_length {
            return Err(ConfigError::ResourceLimitExceeded {
                message: format!(
                    "max_output_length {} exceeds the positional table length {}",
                    self.max_output_length, self.max_sequence_length
                ),
            });
        }
        Ok(())
    }

    fn get_defaults() -> Self {
        Self::default()
    }
}

impl LineCnnTransformerConfig {
    /// Loads and validates a JSON configuration.
    pub fn from_path(path: impl AsRef<Path>) -> RecResult<Self> {
        load_config(path)
    }

    /// Default configuration sized for `mapping`.
    pub fn for_mapping(mapping: &CharacterMapping) -> Self {
        Self {
            num_classes: mapping.len(),
            ..Self::default()
        }
    }

    /// Configuration of the per-window CNN, which emits `tf_dim` features.
    pub fn cnn_config(&self) -> CnnConfig {
        CnnConfig {
            input_channels: 1,
            input_height: self.input_height,
            window_width: self.window_width,
            conv_dim: self.conv_dim,
            fc_dim: self.fc_dim,
            output_dim: self.tf_dim,
            dropout: self.cnn_dropout,
        }
    }
}
