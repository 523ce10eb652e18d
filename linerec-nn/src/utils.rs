//! Utility functions for the candle models.
//!
//! Device parsing, candle error bridging and image-to-tensor conversion.

use candle_core::{D, DType, Device, Tensor};
use image::GrayImage;
use linerec_core::core::errors::ProcessingStage;
use linerec_core::core::{RecResult, RecognitionError};
use linerec_core::utils::gray_to_chw;

#[cfg_attr(all(feature = "cuda", feature = "metal"), allow(dead_code))]
fn gpu_not_enabled(backend: &str) -> RecognitionError {
    RecognitionError::InvalidConfiguration {
        message: format!(
            "{backend} support not enabled. Compile with --features {backend}"
        ),
    }
}

/// Parse a device string into a candle `Device`.
///
/// Accepts `cpu`, `cuda` / `gpu`, `cuda:N` and `metal`.
pub fn parse_device(device_str: &str) -> RecResult<Device> {
    let device_str = device_str.to_lowercase();
    match device_str.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0).map_err(|e| RecognitionError::InvalidConfiguration {
                    message: format!("Failed to create CUDA device: {}", e),
                })
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(gpu_not_enabled("cuda"))
            }
        }
        s if s.starts_with("cuda:") => {
            let ordinal: usize = s
                .trim_start_matches("cuda:")
                .parse()
                .map_err(|_| RecognitionError::InvalidConfiguration {
                    message: format!("Invalid CUDA device ordinal in '{}'", s),
                })?;
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(ordinal).map_err(|e| RecognitionError::InvalidConfiguration {
                    message: format!("Failed to create CUDA device {}: {}", ordinal, e),
                })
            }
            #[cfg(not(feature = "cuda"))]
            {
                let _ = ordinal;
                Err(gpu_not_enabled("cuda"))
            }
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0).map_err(|e| RecognitionError::InvalidConfiguration {
                    message: format!("Failed to create Metal device: {}", e),
                })
            }
            #[cfg(not(feature = "metal"))]
            {
                Err(gpu_not_enabled("metal"))
            }
        }
        _ => Err(RecognitionError::InvalidConfiguration {
            message: format!(
                "Unknown device: '{}'. Use 'cpu', 'cuda', 'cuda:N', or 'metal'",
                device_str
            ),
        }),
    }
}

/// Convert a candle error to a `RecognitionError` raised while running a model.
pub fn candle_to_rec_inference(
    model_name: &str,
    context: impl Into<String>,
    err: candle_core::Error,
) -> RecognitionError {
    RecognitionError::inference(model_name, context, err)
}

/// Convert a candle error to a `RecognitionError` for processing operations.
pub fn candle_to_rec_processing(
    kind: ProcessingStage,
    context: impl Into<String>,
    err: candle_core::Error,
) -> RecognitionError {
    RecognitionError::processing_error(kind, context, err)
}

/// Stack same-sized grayscale line images into a `(B, 1, H, W)` f32 tensor.
pub fn images_to_tensor(images: &[GrayImage], device: &Device) -> RecResult<Tensor> {
    let (data, shape) = gray_to_chw(images)?;
    Tensor::from_vec(data, (shape[0], shape[1], shape[2], shape[3]), device).map_err(|e| {
        candle_to_rec_processing(
            ProcessingStage::ImageConversion,
            "create image tensor",
            e,
        )
    })
}

/// Converts `(B, L)` integer token ids into host vectors.
pub fn tokens_to_vec(tokens: &Tensor) -> RecResult<Vec<Vec<u32>>> {
    tokens
        .to_dtype(DType::U32)
        .and_then(|t| t.to_vec2::<u32>())
        .map_err(|e| candle_to_rec_processing(ProcessingStage::Decoding, "read token ids", e))
}

/// Argmax over the class axis of `(B, K, S)` scores, returned as `(B, S)` host ids.
pub fn argmax_classes(scores: &Tensor) -> RecResult<Vec<Vec<u32>>> {
    scores
        .argmax(1)
        .and_then(|t| t.to_vec2::<u32>())
        .map_err(|e| candle_to_rec_processing(ProcessingStage::Decoding, "argmax over classes", e))
}

/// Argmax over the last axis of `(B, K)` scores.
pub(crate) fn argmax_last(scores: &Tensor) -> RecResult<Vec<u32>> {
    scores
        .argmax(D::Minus1)
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(|e| candle_to_rec_processing(ProcessingStage::Decoding, "argmax over logits", e))
}
