//! Constants used throughout the recognizer.
//!
//! Default hyper-parameters of the reference models, the fixed line height
//! and the control tokens of the character mapping.

/// Height (and width) of a single character cell in pixels.
///
/// Every line image fed to a model must have exactly this height.
pub const IMAGE_SIZE: usize = 28;

/// Default width of the window that slides over a line image.
pub const DEFAULT_WINDOW_WIDTH: usize = 28;

/// Default horizontal offset between consecutive windows.
pub const DEFAULT_WINDOW_STRIDE: usize = 28;

/// Default number of channels in the per-window convolution layers.
pub const DEFAULT_CONV_DIM: usize = 64;

/// Default width of the per-window fully connected layer.
pub const DEFAULT_FC_DIM: usize = 128;

/// Default embedding depth of the transformer decoder.
pub const DEFAULT_TF_DIM: usize = 256;

/// Default width of the transformer feed-forward block.
pub const DEFAULT_TF_FC_DIM: usize = 1024;

/// Default number of attention heads.
pub const DEFAULT_TF_NHEAD: usize = 4;

/// Default number of decoder layers.
pub const DEFAULT_TF_LAYERS: usize = 4;

/// Default dropout probability of the per-window CNN.
pub const DEFAULT_CNN_DROPOUT: f32 = 0.25;

/// Default dropout probability inside the transformer.
pub const DEFAULT_TF_DROPOUT: f32 = 0.4;

/// Size of the reference mapping: four control tokens, digits, letters and
/// seventeen punctuation marks.
pub const DEFAULT_NUM_CLASSES: usize = 83;

/// Default maximum number of tokens in an output sequence, control tokens included.
pub const DEFAULT_MAX_OUTPUT_LENGTH: usize = 34;

/// Default number of rows precomputed by the 2-D positional table.
pub const DEFAULT_MAX_FEATURE_HEIGHT: usize = 8;

/// Default number of columns precomputed by the 2-D positional table.
pub const DEFAULT_MAX_FEATURE_WIDTH: usize = 512;

/// Default number of positions precomputed by the 1-D positional table.
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 5000;

/// Blank token, first entry of every mapping.
pub const BLANK_TOKEN: &str = "<B>";

/// Start-of-sequence token.
pub const START_TOKEN: &str = "<S>";

/// End-of-sequence token.
pub const END_TOKEN: &str = "<E>";

/// Padding token.
pub const PADDING_TOKEN: &str = "<P>";

/// Control tokens in the order they occupy the head of a mapping.
pub const CONTROL_TOKENS: [&str; 4] = [BLANK_TOKEN, START_TOKEN, END_TOKEN, PADDING_TOKEN];

/// Class index of [`START_TOKEN`] in every mapping.
pub const START_INDEX: u32 = 1;

/// Class index of [`END_TOKEN`] in every mapping.
pub const END_INDEX: u32 = 2;

/// Class index of [`PADDING_TOKEN`] in every mapping.
pub const PADDING_INDEX: u32 = 3;
