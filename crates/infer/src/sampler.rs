//! Decoding strategies: greedy, temperature, top-k, top-p.
//!
//! Sampling draws from a seeded `StdRng`, so a fixed seed reproduces a
//! generation exactly.

use candle_core::{Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// `0.0` selects greedy decoding.
    pub temperature: f64,
    /// Keep only the `top_k` largest logits (`0` disables).
    pub top_k: usize,
    /// Nucleus threshold (`1.0` disables).
    pub top_p: f64,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 1.0,
            seed: 0,
        }
    }
}

pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Sample one token from a 1-D logits tensor of `vocab_size`.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let mut logits: Vec<f32> = logits.to_vec1()?;
        if logits.is_empty() {
            candle_core::bail!("cannot sample from empty logits");
        }
        if self.config.temperature < 1e-6 {
            return Ok(argmax(&logits));
        }

        let temp = self.config.temperature as f32;
        for v in &mut logits {
            *v /= temp;
        }

        if self.config.top_k > 0 && self.config.top_k < logits.len() {
            let mut sorted = logits.clone();
            sorted.sort_unstable_by(|a, b| b.total_cmp(a));
            let threshold = sorted[self.config.top_k - 1];
            for v in &mut logits {
                if *v < threshold {
                    *v = f32::NEG_INFINITY;
                }
            }
        }

        let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<f32> = logits.iter().map(|&v| (v - max_val).exp()).collect();
        normalize(&mut probs);

        if self.config.top_p < 1.0 {
            let mut order: Vec<usize> = (0..probs.len()).collect();
            order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));
            let mut cumsum = 0.0f32;
            let mut cut = order.len();
            for (rank, &idx) in order.iter().enumerate() {
                cumsum += probs[idx];
                if cumsum >= self.config.top_p as f32 {
                    cut = rank + 1;
                    break;
                }
            }
            for &idx in &order[cut..] {
                probs[idx] = 0.0;
            }
            normalize(&mut probs);
        }

        let r: f32 = self.rng.gen();
        Ok(weighted_index(&probs, r))
    }
}

fn normalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

fn argmax(v: &[f32]) -> u32 {
    v.iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Index whose cumulative probability first reaches `r`; zero-probability
/// entries are never returned.
fn weighted_index(probs: &[f32], r: f32) -> u32 {
    let mut cumsum = 0.0;
    let mut last = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumsum += p;
        last = i;
        if cumsum >= r {
            return i as u32;
        }
    }
    last as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(v: &[f32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 0.0,
            ..Default::default()
        });
        assert_eq!(sampler.sample(&logits(&[0.1, 0.9, 0.3, 0.5])).unwrap(), 1);
    }

    #[test]
    fn top_k_one_is_greedy() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 1,
            seed: 7,
            ..Default::default()
        });
        for _ in 0..20 {
            assert_eq!(sampler.sample(&logits(&[0.1, 0.2, 3.0, 0.5])).unwrap(), 2);
        }
    }

    #[test]
    fn top_k_restricts_support() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 2,
            seed: 3,
            ..Default::default()
        });
        for _ in 0..50 {
            let t = sampler.sample(&logits(&[1.0, 0.0, 1.1, -1.0])).unwrap();
            assert!(t == 0 || t == 2, "sampled {t}");
        }
    }

    #[test]
    fn same_seed_same_tokens() {
        let draw = |seed| {
            let mut sampler = Sampler::new(SamplerConfig {
                temperature: 1.0,
                top_k: 0,
                seed,
                ..Default::default()
            });
            (0..16)
                .map(|_| sampler.sample(&logits(&[0.0, 0.1, 0.2, 0.3, 0.4])).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(11), draw(11));
    }

    #[test]
    fn top_p_keeps_the_nucleus() {
        let mut sampler = Sampler::new(SamplerConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 0.5,
            seed: 5,
        });
        // Token 3 alone carries more than half of the mass.
        for _ in 0..20 {
            assert_eq!(sampler.sample(&logits(&[0.0, 0.0, 0.0, 5.0])).unwrap(), 3);
        }
    }

    #[test]
    fn weighted_index_skips_zero_mass() {
        assert_eq!(weighted_index(&[0.0, 1.0, 0.0], 1.0), 1);
        assert_eq!(weighted_index(&[0.5, 0.5, 0.0], 0.2), 0);
    }
}
