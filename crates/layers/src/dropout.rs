//! Dropout as an explicit value object.
//!
//! Callers pass `train` on every call instead of toggling a module-wide mode
//! flag. When active, each element is zeroed with probability `p` and the
//! survivors are scaled by `1 / (1 - p)` so the expected value is unchanged.
//! Works on tensors of any rank.

use std::sync::Mutex;

use candle_core::{DType, Error, Result, Tensor};

use crate::checks;

/// Randomness backing a [`Dropout`].
#[derive(Debug)]
pub enum DropoutRng {
    /// Deterministic generator; identical seeds produce identical masks.
    Seeded(Mutex<Lcg64>),
    /// Uses the tensor device's random number generator.
    Device,
}

/// Stochastic zeroing-and-rescaling applied only in training mode.
#[derive(Debug)]
pub struct Dropout {
    probability: f32,
    rng: DropoutRng,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        let rng = match &self.rng {
            DropoutRng::Seeded(state) => {
                let state = match state.lock() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                DropoutRng::Seeded(Mutex::new(state))
            }
            DropoutRng::Device => DropoutRng::Device,
        };
        Self {
            probability: self.probability,
            rng,
        }
    }
}

impl Dropout {
    /// Dropout driven by the device RNG. `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32) -> Result<Self> {
        Self::validate(probability)?;
        Ok(Self {
            probability,
            rng: DropoutRng::Device,
        })
    }

    /// Dropout with a reproducible mask sequence.
    pub fn seeded(probability: f32, seed: u64) -> Result<Self> {
        Self::validate(probability)?;
        Ok(Self {
            probability,
            rng: DropoutRng::Seeded(Mutex::new(Lcg64::new(seed))),
        })
    }

    /// A dropout that never drops anything.
    pub fn disabled() -> Self {
        Self {
            probability: 0.0,
            rng: DropoutRng::Device,
        }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// True when a training-mode call would modify its input.
    pub fn is_active(&self) -> bool {
        self.probability > 0.0
    }

    fn validate(probability: f32) -> Result<()> {
        if (0.0..1.0).contains(&probability) {
            Ok(())
        } else {
            Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )))
        }
    }

    /// Applies dropout when `train` is set; otherwise returns `xs` unchanged.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || !self.is_active() {
            return Ok(xs.clone());
        }
        match &self.rng {
            DropoutRng::Device => candle_nn::ops::dropout(xs, self.probability),
            DropoutRng::Seeded(state) => {
                let keep_prob = 1.0 - self.probability;
                let total = xs.elem_count();
                let mask_data = {
                    let mut rng = state
                        .lock()
                        .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
                    (0..total)
                        .map(|_| {
                            if rng.next_f32() < keep_prob {
                                1.0 / keep_prob
                            } else {
                                0.0
                            }
                        })
                        .collect::<Vec<f32>>()
                };
                checks::ensure_cast_supported("dropout.mask", DType::F32, xs.dtype())?;
                let mask = Tensor::from_vec(mask_data, xs.dims(), xs.device())?
                    .to_dtype(xs.dtype())?;
                xs.mul(&mask)
            }
        }
    }
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX constants.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
