//! Seedable dropout and the train/eval mode flag.
//!
//! Dropout draws from its own RNG, seeded at construction, and only fires
//! when the caller passes [`Mode::Train`]. No global random state is used,
//! so two models built with the same seeds drop the same elements.

use candle_core::Tensor;
use linerec_core::core::{RecResult, RecognitionError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

use crate::utils::candle_to_rec_inference;

/// Whether a forward pass is part of training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Stochastic layers are active.
    Train,
    /// Deterministic inference.
    #[default]
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Inverted dropout: kept elements are scaled by `1 / (1 - p)`.
#[derive(Debug)]
pub struct Dropout {
    p: f32,
    rng: Mutex<StdRng>,
}

impl Dropout {
    /// Creates a dropout layer with drop probability `p` in `[0, 1)`.
    pub fn new(p: f32, seed: u64) -> RecResult<Self> {
        if !p.is_finite() || !(0.0..1.0).contains(&p) {
            return Err(RecognitionError::invalid_configuration(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
        Ok(Self {
            p,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    /// Restarts the random stream from `seed`.
    pub fn reseed(&self, seed: u64) -> RecResult<()> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| RecognitionError::invalid_input("dropout rng lock poisoned"))?;
        *rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    /// Applies dropout in training mode; returns `x` unchanged otherwise.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> RecResult<Tensor> {
        if !mode.is_train() || self.p == 0.0 {
            return Ok(x.clone());
        }

        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| RecognitionError::invalid_input("dropout rng lock poisoned"))?;
            (0..x.elem_count())
                .map(|_| {
                    if rng.random::<f32>() < self.p {
                        0.0
                    } else {
                        scale
                    }
                })
                .collect()
        };

        Tensor::from_vec(mask, x.dims(), x.device())
            .and_then(|m| m.to_dtype(x.dtype()))
            .and_then(|m| x.mul(&m))
            .map_err(|e| candle_to_rec_inference("Dropout", "apply mask", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_eval_is_identity() -> RecResult<()> {
        let dropout = Dropout::new(0.5, 7)?;
        let x = Tensor::ones((4, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = dropout.forward(&x, Mode::Eval)?;
        assert_eq!(
            y.to_vec2::<f32>().unwrap(),
            x.to_vec2::<f32>().unwrap()
        );
        Ok(())
    }

    #[test]
    fn test_train_zeroes_and_rescales() -> RecResult<()> {
        let dropout = Dropout::new(0.5, 7)?;
        let x = Tensor::ones((64, 64), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y: Vec<f32> = dropout
            .forward(&x, Mode::Train)?
            .flatten_all()
            .and_then(|t| t.to_vec1())
            .unwrap();
        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        let dropped = y.iter().filter(|&&v| v == 0.0).count();
        // 4096 draws at p = 0.5
        assert!((1700..2400).contains(&dropped), "dropped {dropped}");
        Ok(())
    }

    #[test]
    fn test_same_seed_same_mask() -> RecResult<()> {
        let x = Tensor::ones((16, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
        let a = Dropout::new(0.3, 42)?.forward(&x, Mode::Train)?;
        let b = Dropout::new(0.3, 42)?.forward(&x, Mode::Train)?;
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());

        let c = Dropout::new(0.3, 42)?;
        let first = c.forward(&x, Mode::Train)?;
        c.reseed(42)?;
        let again = c.forward(&x, Mode::Train)?;
        assert_eq!(
            first.to_vec2::<f32>().unwrap(),
            again.to_vec2::<f32>().unwrap()
        );
        Ok(())
    }

    #[test]
    fn test_invalid_probability() {
        assert!(Dropout::new(1.0, 0).is_err());
        assert!(Dropout::new(-0.1, 0).is_err());
        assert!(Dropout::new(f32::NAN, 0).is_err());
    }
}
