use linerec_core::ConfigValidator;
use linerec_core::core::config::load_config;
use linerec_core::core::constants::{
    DEFAULT_CNN_DROPOUT, DEFAULT_CONV_DIM, DEFAULT_FC_DIM, DEFAULT_MAX_OUTPUT_LENGTH,
    DEFAULT_NUM_CLASSES, DEFAULT_WINDOW_STRIDE, DEFAULT_WINDOW_WIDTH, IMAGE_SIZE,
};
use linerec_core::core::RecResult;
use linerec_core::domain::CharacterMapping;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cnn::CnnConfig;
use crate::sliding_window::WindowExecution;

/// Hyper-parameters of [`LineCnnSimple`](super::LineCnnSimple).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ConfigValidator)]
#[serde(default)]
pub struct LineCnnSimpleConfig {
    #[validate(min = 2)]
    pub window_width: usize,
    #[validate(min = 1)]
    pub window_stride: usize,
    /// Keep only the first `max_output_length` positions of the output.
    pub limit_output_length: bool,
    #[validate(min = 1)]
    pub max_output_length: usize,
    #[validate(min = 2)]
    pub input_height: usize,
    #[validate(min = 1)]
    pub conv_dim: usize,
    #[validate(min = 1)]
    pub fc_dim: usize,
    #[validate(range(min = 0.0, max = 0.95))]
    pub dropout: f32,
    /// Size of the output alphabet, control tokens included.
    #[validate(min = 1)]
    pub num_classes: usize,
    pub execution: WindowExecution,
    /// Seed of the dropout streams.
    pub seed: u64,
}

impl Default for LineCnnSimpleConfig {
    fn default() -> Self {
        Self {
            window_width: DEFAULT_WINDOW_WIDTH,
            window_stride: DEFAULT_WINDOW_STRIDE,
            limit_output_length: false,
            max_output_length: DEFAULT_MAX_OUTPUT_LENGTH,
            input_height: IMAGE_SIZE,
            conv_dim: DEFAULT_CONV_DIM,
            fc_dim: DEFAULT_FC_DIM,
            dropout: DEFAULT_CNN_DROPOUT,
            num_classes: DEFAULT_NUM_CLASSES,
            execution: WindowExecution::default(),
            seed: 0,
        }
    }
}

impl LineCnnSimpleConfig {
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

    /// Output length limit handed to the sliding-window encoder.
    pub fn output_length_limit(&self) -> Option<usize> {
        self.limit_output_length.then_some(self.max_output_length)
    }

    /// Configuration of the per-window CNN.
    pub fn cnn_config(&self) -> CnnConfig {
        CnnConfig {
            input_channels: 1,
            input_height: self.input_height,
            window_width: self.window_width,
            conv_dim: self.conv_dim,
            fc_dim: self.fc_dim,
            output_dim: self.num_classes,
            dropout: self.dropout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linerec_core::core::config::ConfigValidator;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LineCnnSimpleConfig::get_defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.output_length_limit(), None);
        assert_eq!(config.cnn_config().output_dim, DEFAULT_NUM_CLASSES);
    }

    #[test]
    fn test_for_mapping() {
        let mapping = CharacterMapping::new("abc".chars());
        let config = LineCnnSimpleConfig::for_mapping(&mapping);
        assert_eq!(config.num_classes, 7);
    }

    #[test]
    fn test_from_path_partial_json() -> RecResult<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{"window_width": 16, "window_stride": 8, "limit_output_length": true, "max_output_length": 12, "execution": "batched"}}"#
        )?;
        let config = LineCnnSimpleConfig::from_path(file.path())?;
        assert_eq!(config.window_width, 16);
        assert_eq!(config.window_stride, 8);
        assert_eq!(config.output_length_limit(), Some(12));
        assert_eq!(config.execution, WindowExecution::Batched);
        assert_eq!(config.conv_dim, DEFAULT_CONV_DIM);
        Ok(())
    }

    #[test]
    fn test_zero_stride_is_rejected() -> RecResult<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"window_stride": 0}}"#)?;
        assert!(LineCnnSimpleConfig::from_path(file.path()).is_err());
        Ok(())
    }
}
