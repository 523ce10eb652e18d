//! Sliding-window sequence encoder.
//!
//! Turns a `(B, C, H, W)` line image into a `(B, K, S)` activation tensor by
//! sliding a fixed-width window along the width axis and running a
//! [`FeatureExtractor`] on every window. Slice `s` of the output holds the
//! features of the window starting at column `s * stride`.

use candle_core::Tensor;
use linerec_core::core::{RecResult, RecognitionError};
use linerec_core::processors::{WindowGeometry, WindowSpan, compute_windows};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cnn::FeatureExtractor;
use crate::dropout::Mode;
use crate::utils::candle_to_rec_inference;

/// How the windows of one image are fed to the extractor.
///
/// The windows are independent, so every strategy yields the same tensor in
/// [`Mode::Eval`]. In [`Mode::Train`] dropout draws from one seeded stream per
/// layer, so `Parallel` falls back to `Sequential` to keep the draw order
/// fixed. `Batched` draws in its own (also fixed) order and so drops
/// different elements than the per-window strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowExecution {
    /// One extractor call per window, in order.
    #[default]
    Sequential,
    /// One extractor call per window on the rayon pool. Runs sequentially
    /// in training mode.
    Parallel,
    /// All windows folded into the batch axis, one extractor call.
    Batched,
}

/// Encodes line images window by window.
#[derive(Debug, Clone)]
pub struct SlidingWindowEncoder {
    window_width: usize,
    window_stride: usize,
    input_height: usize,
    output_length_limit: Option<usize>,
    execution: WindowExecution,
}

impl SlidingWindowEncoder {
    /// Creates an encoder.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` when the window width, the stride, the input
    /// height or a configured limit is zero.
    pub fn new(
        window_width: usize,
        window_stride: usize,
        input_height: usize,
        output_length_limit: Option<usize>,
    ) -> RecResult<Self> {
        if window_width == 0 || window_stride == 0 || input_height == 0 {
            return Err(RecognitionError::invalid_configuration(format!(
                "sliding window needs positive sizes, got window_width={}, window_stride={}, input_height={}",
                window_width, window_stride, input_height
            )));
        }
        if output_length_limit == Some(0) {
            return Err(RecognitionError::invalid_configuration(
                "output length limit must be at least 1",
            ));
        }
        Ok(Self {
            window_width,
            window_stride,
            input_height,
            output_length_limit,
            execution: WindowExecution::default(),
        })
    }

    /// Selects the execution strategy.
    pub fn with_execution(mut self, execution: WindowExecution) -> Self {
        self.execution = execution;
        self
    }

    pub fn window_width(&self) -> usize {
        self.window_width
    }

    pub fn window_stride(&self) -> usize {
        self.window_stride
    }

    pub fn input_height(&self) -> usize {
        self.input_height
    }

    pub fn output_length_limit(&self) -> Option<usize> {
        self.output_length_limit
    }

    pub fn execution(&self) -> WindowExecution {
        self.execution
    }

    /// Window geometry for an image of `width` columns.
    pub fn geometry(&self, width: usize) -> RecResult<WindowGeometry> {
        compute_windows(width, self.window_width, self.window_stride)
    }

    /// Length of the encoded sequence for an image of `width` columns, after
    /// the output length limit.
    pub fn output_length(&self, width: usize) -> RecResult<usize> {
        let geometry = self.geometry(width)?;
        Ok(geometry.limited_spans(self.output_length_limit).len())
    }

    /// Encodes `image` into a `(B, K, S)` tensor.
    ///
    /// When an output length limit smaller than `S` is configured only the
    /// first `limit` windows are extracted; the result equals encoding every
    /// window and keeping the first `limit` positions.
    ///
    /// # Errors
    ///
    /// * `InvalidGeometry` when `image` is not rank 4, its height differs
    ///   from the configured input height, or it is narrower than a window.
    /// * `DimensionMismatch` when the extractor does not return `(B, K)`.
    pub fn encode<F>(&self, image: &Tensor, extractor: &F, mode: Mode) -> RecResult<Tensor>
    where
        F: FeatureExtractor + ?Sized,
    {
        let dims = image.dims();
        if dims.len() != 4 {
            return Err(RecognitionError::invalid_geometry(format!(
                "expected a (B, C, H, W) image, got shape {:?}",
                dims
            )));
        }
        let (batch, height, width) = (dims[0], dims[2], dims[3]);
        if height != self.input_height {
            return Err(RecognitionError::invalid_geometry(format!(
                "image height {} does not match the configured input height {}",
                height, self.input_height
            )));
        }

        let geometry = self.geometry(width)?;
        let spans = geometry.limited_spans(self.output_length_limit);
        if spans.len() < geometry.sequence_length() {
            tracing::debug!(
                "keeping {} of {} windows for width {}",
                spans.len(),
                geometry.sequence_length(),
                width
            );
        }

        let output_dim = extractor.output_dim();
        let execution = match self.execution {
            WindowExecution::Parallel if mode.is_train() => {
                tracing::debug!("running {} windows sequentially in training mode", spans.len());
                WindowExecution::Sequential
            }
            execution => execution,
        };
        match execution {
            WindowExecution::Sequential => {
                let outputs = spans
                    .iter()
                    .map(|span| self.extract_window(image, *span, extractor, batch, output_dim, mode))
                    .collect::<RecResult<Vec<_>>>()?;
                stack_positions(&outputs)
            }
            WindowExecution::Parallel => {
                let outputs = spans
                    .par_iter()
                    .map(|span| self.extract_window(image, *span, extractor, batch, output_dim, mode))
                    .collect::<RecResult<Vec<_>>>()?;
                stack_positions(&outputs)
            }
            WindowExecution::Batched => {
                self.extract_batched(image, spans, extractor, batch, output_dim, mode)
            }
        }
    }

    fn extract_window<F>(
        &self,
        image: &Tensor,
        span: WindowSpan,
        extractor: &F,
        batch: usize,
        output_dim: usize,
        mode: Mode,
    ) -> RecResult<Tensor>
    where
        F: FeatureExtractor + ?Sized,
    {
        let window = image
            .narrow(3, span.start, span.width())
            .and_then(|w| w.contiguous())
            .map_err(|e| candle_to_rec_inference("SlidingWindowEncoder", "slice window", e))?;
        let features = extractor.extract(&window, mode)?;
        check_features(&features, batch, output_dim)?;
        Ok(features)
    }

    fn extract_batched<F>(
        &self,
        image: &Tensor,
        spans: &[WindowSpan],
        extractor: &F,
        batch: usize,
        output_dim: usize,
        mode: Mode,
    ) -> RecResult<Tensor>
    where
        F: FeatureExtractor + ?Sized,
    {
        let windows = spans
            .iter()
            .map(|span| image.narrow(3, span.start, span.width()))
            .collect::<candle_core::Result<Vec<_>>>()
            .and_then(|windows| Tensor::cat(&windows, 0))
            .map_err(|e| candle_to_rec_inference("SlidingWindowEncoder", "fold windows", e))?;

        // (S * B, K), window-major
        let features = extractor.extract(&windows, mode)?;
        check_features(&features, spans.len() * batch, output_dim)?;

        features
            .reshape((spans.len(), batch, output_dim))
            .and_then(|f| f.permute((1, 2, 0)))
            .and_then(|f| f.contiguous())
            .map_err(|e| candle_to_rec_inference("SlidingWindowEncoder", "unfold windows", e))
    }
}

fn check_features(features: &Tensor, batch: usize, output_dim: usize) -> RecResult<()> {
    match features.dims() {
        [b, k] if *b == batch && *k == output_dim => Ok(()),
        [b, k] if *b == batch => Err(RecognitionError::dimension_mismatch(
            "feature extractor output width",
            output_dim,
            *k,
        )),
        [b, _] => Err(RecognitionError::dimension_mismatch(
            "feature extractor batch",
            batch,
            *b,
        )),
        other => Err(RecognitionError::dimension_mismatch(
            "feature extractor rank",
            2,
            other.len(),
        )),
    }
}

/// Stacks `S` tensors of shape `(B, K)` into `(B, K, S)`.
fn stack_positions(outputs: &[Tensor]) -> RecResult<Tensor> {
    Tensor::stack(outputs, 2)
        .map_err(|e| candle_to_rec_inference("SlidingWindowEncoder", "stack windows", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dropout::Dropout;
    use candle_core::{DType, Device, IndexOp};

    /// Returns the top row of the window, so feature `k` of window `s` is
    /// pixel `(0, s * stride + k)`.
    struct TopRow {
        width: usize,
    }

    impl FeatureExtractor for TopRow {
        fn extract(&self, window: &Tensor, _mode: Mode) -> RecResult<Tensor> {
            window
                .i((.., 0, 0, ..))
                .and_then(|t| t.contiguous())
                .map_err(|e| candle_to_rec_inference("TopRow", "slice", e))
        }

        fn output_dim(&self) -> usize {
            self.width
        }
    }

    /// Top row of the window passed through a seeded dropout layer.
    struct DroppedTopRow {
        width: usize,
        dropout: Dropout,
    }

    impl FeatureExtractor for DroppedTopRow {
        fn extract(&self, window: &Tensor, mode: Mode) -> RecResult<Tensor> {
            let row = window
                .i((.., 0, 0, ..))
                .and_then(|t| t.contiguous())
                .map_err(|e| candle_to_rec_inference("DroppedTopRow", "slice", e))?;
            self.dropout.forward(&row, mode)
        }

        fn output_dim(&self) -> usize {
            self.width
        }
    }

    /// Always returns a vector of the wrong width.
    struct WrongWidth;

    impl FeatureExtractor for WrongWidth {
        fn extract(&self, window: &Tensor, _mode: Mode) -> RecResult<Tensor> {
            let batch = window.dims()[0];
            Tensor::zeros((batch, 3), DType::F32, window.device())
                .map_err(|e| candle_to_rec_inference("WrongWidth", "zeros", e))
        }

        fn output_dim(&self) -> usize {
            4
        }
    }

    fn ramp_image(batch: usize, height: usize, width: usize) -> Tensor {
        Tensor::arange(0f32, (batch * height * width) as f32, &Device::Cpu)
            .and_then(|t| t.reshape((batch, 1, height, width)))
            .unwrap()
    }

    #[test]
    fn test_single_window_image() -> RecResult<()> {
        let encoder = SlidingWindowEncoder::new(28, 28, 28, None)?;
        let image = ramp_image(1, 28, 28);
        let out = encoder.encode(&image, &TopRow { width: 28 }, Mode::Eval)?;
        assert_eq!(out.dims(), &[1, 28, 1]);
        Ok(())
    }

    #[test]
    fn test_positions_follow_window_starts() -> RecResult<()> {
        let (height, width, ww, ws) = (4usize, 20usize, 6usize, 4usize);
        let encoder = SlidingWindowEncoder::new(ww, ws, height, None)?;
        let image = ramp_image(2, height, width);
        let out = encoder.encode(&image, &TopRow { width: ww }, Mode::Eval)?;
        // floor((20 - 6) / 4) + 1
        assert_eq!(out.dims(), &[2, ww, 4]);

        let out: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        let plane = (height * width) as f32;
        for (b, rows) in out.iter().enumerate() {
            for (k, row) in rows.iter().enumerate() {
                for (s, value) in row.iter().enumerate() {
                    let expected = b as f32 * plane + (s * ws + k) as f32;
                    assert_eq!(*value, expected, "b={b} k={k} s={s}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_limit_keeps_leading_positions() -> RecResult<()> {
        let image = ramp_image(1, 4, 20);
        let extractor = TopRow { width: 4 };
        let full = SlidingWindowEncoder::new(4, 4, 4, None)?.encode(&image, &extractor, Mode::Eval)?;
        let limited =
            SlidingWindowEncoder::new(4, 4, 4, Some(3))?.encode(&image, &extractor, Mode::Eval)?;
        assert_eq!(full.dims(), &[1, 4, 5]);
        assert_eq!(limited.dims(), &[1, 4, 3]);
        assert_eq!(
            limited.to_vec3::<f32>().unwrap(),
            full.i((.., .., 0..3)).unwrap().to_vec3::<f32>().unwrap()
        );

        // A limit above S leaves the output untouched
        let loose =
            SlidingWindowEncoder::new(4, 4, 4, Some(10))?.encode(&image, &extractor, Mode::Eval)?;
        assert_eq!(loose.dims(), &[1, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_strategies_agree() -> RecResult<()> {
        let image = ramp_image(3, 5, 31);
        let extractor = TopRow { width: 7 };
        let base = SlidingWindowEncoder::new(7, 3, 5, Some(6))?;
        let reference = base
            .clone()
            .encode(&image, &extractor, Mode::Eval)?
            .to_vec3::<f32>()
            .unwrap();
        for execution in [WindowExecution::Parallel, WindowExecution::Batched] {
            let out = base
                .clone()
                .with_execution(execution)
                .encode(&image, &extractor, Mode::Eval)?;
            assert_eq!(out.to_vec3::<f32>().unwrap(), reference, "{execution:?}");
        }
        Ok(())
    }

    #[test]
    fn test_parallel_training_is_reproducible() -> RecResult<()> {
        let image = (ramp_image(2, 4, 400) + 1.0).unwrap();
        let encoder =
            SlidingWindowEncoder::new(8, 4, 4, None)?.with_execution(WindowExecution::Parallel);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(8)
            .build()
            .unwrap();

        let run = |seed: u64| -> RecResult<Vec<Vec<Vec<f32>>>> {
            let extractor = DroppedTopRow {
                width: 8,
                dropout: Dropout::new(0.5, seed)?,
            };
            let out = pool.install(|| encoder.encode(&image, &extractor, Mode::Train))?;
            Ok(out.to_vec3::<f32>().unwrap())
        };

        let reference = run(7)?;
        for _ in 0..10 {
            assert_eq!(run(7)?, reference);
        }

        // Same draws as the sequential strategy with the same seed
        let sequential = DroppedTopRow {
            width: 8,
            dropout: Dropout::new(0.5, 7)?,
        };
        let out = encoder
            .clone()
            .with_execution(WindowExecution::Sequential)
            .encode(&image, &sequential, Mode::Train)?;
        assert_eq!(out.to_vec3::<f32>().unwrap(), reference);
        Ok(())
    }

    #[test]
    fn test_height_mismatch() -> RecResult<()> {
        let encoder = SlidingWindowEncoder::new(4, 4, 28, None)?;
        let image = ramp_image(1, 27, 40);
        assert!(matches!(
            encoder.encode(&image, &TopRow { width: 4 }, Mode::Eval),
            Err(RecognitionError::InvalidGeometry { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_image_narrower_than_window() -> RecResult<()> {
        let encoder = SlidingWindowEncoder::new(28, 28, 28, None)?;
        let image = ramp_image(1, 28, 20);
        assert!(matches!(
            encoder.encode(&image, &TopRow { width: 28 }, Mode::Eval),
            Err(RecognitionError::InvalidGeometry { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_extractor_shape_is_checked() -> RecResult<()> {
        let image = ramp_image(2, 4, 16);
        for execution in [
            WindowExecution::Sequential,
            WindowExecution::Parallel,
            WindowExecution::Batched,
        ] {
            let encoder = SlidingWindowEncoder::new(4, 4, 4, None)?.with_execution(execution);
            assert!(matches!(
                encoder.encode(&image, &WrongWidth, Mode::Eval),
                Err(RecognitionError::DimensionMismatch { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn test_invalid_construction() {
        assert!(SlidingWindowEncoder::new(0, 4, 28, None).is_err());
        assert!(SlidingWindowEncoder::new(4, 0, 28, None).is_err());
        assert!(SlidingWindowEncoder::new(4, 4, 28, Some(0)).is_err());
    }

    #[test]
    fn test_output_length() -> RecResult<()> {
        let encoder = SlidingWindowEncoder::new(28, 28, 28, Some(2))?;
        assert_eq!(encoder.output_length(28)?, 1);
        assert_eq!(encoder.output_length(84)?, 2);
        Ok(())
    }
}
