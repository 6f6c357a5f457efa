//! Learning-rate schedules.
//!
//! Every schedule starts with a linear warmup to the peak rate, then decays:
//!
//! | Decay | After warmup |
//! |-------|--------------|
//! | `cosine` | half cosine from peak to `lr_min` at `max_steps` |
//! | `linear` | straight line from peak to `lr_min` at `max_steps` |
//! | `rsqrt` | `peak · sqrt(warmup / step)`, floored at `lr_min` |
//! | `constant` | peak |

use std::str::FromStr;

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LrDecay {
    Cosine,
    Linear,
    Rsqrt,
    Constant,
}

impl FromStr for LrDecay {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "rsqrt" => Ok(Self::Rsqrt),
            "constant" | "none" => Ok(Self::Constant),
            other => anyhow::bail!("unknown lr decay {other:?} (cosine, linear, rsqrt, constant)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    peak: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(peak: f64, lr_min: f64, warmup_steps: usize, max_steps: usize, decay: LrDecay) -> Self {
        Self {
            step: 0,
            peak,
            lr_min,
            warmup_steps,
            max_steps,
            decay,
        }
    }

    /// Learning rate at an arbitrary step.
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.peak * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let since_warmup = step - self.warmup_steps;
        let horizon = self.max_steps.saturating_sub(self.warmup_steps);
        match self.decay {
            LrDecay::Constant => self.peak,
            LrDecay::Rsqrt => {
                let w = self.warmup_steps.max(1) as f64;
                (self.peak * (w / (step as f64).max(w)).sqrt()).max(self.lr_min)
            }
            LrDecay::Cosine | LrDecay::Linear if horizon == 0 => self.peak,
            LrDecay::Cosine => {
                let progress = (since_warmup as f64 / horizon as f64).min(1.0);
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.peak - self.lr_min) * (1.0 + cos)
            }
            LrDecay::Linear => {
                let progress = (since_warmup as f64 / horizon as f64).min(1.0);
                self.peak - (self.peak - self.lr_min) * progress
            }
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}
