//! Position-wise feed-forward networks.
//!
//! | Layer | Formula | Used by |
//! |-------|---------|---------|
//! | [`DenseReluDense`] | `wo · dropout(relu(wi · x))` | builder sub-layer |
//! | [`DenseReluDense`] (gated) | `wo · dropout(gelu(wi_0 · x) ⊙ (wi_1 · x))` | builder sub-layer |
//! | [`TransformerFeedForward`] | `x + dropout(fc2 · dropout(relu(fc1 · LN(x))))` | batch-major layers |

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use gshard_common::BuilderConfig;

use crate::norm::NormLayer;
use crate::ops::{fan_in_uniform, linear_last, xavier_uniform, Dropout};

// ── DenseReluDense ──────────────────────────────────────────────────────────

/// Two-matrix FFN of the builder. Weights live under `<scope>/w/`.
pub struct DenseReluDense {
    wi: Tensor,
    /// Linear branch of the gated-GELU variant.
    wi_linear: Option<Tensor>,
    wo: Tensor,
    dropout: Dropout,
}

impl DenseReluDense {
    pub fn new(config: &BuilderConfig, gated_gelu: bool, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("w");
        let (m, f) = (config.model_dim, config.ff_dim);
        let (wi, wi_linear) = if gated_gelu {
            let wi_0 = vb.get_with_hints((m, f), "wi_0", fan_in_uniform(m))?;
            let wi_1 = vb.get_with_hints((m, f), "wi_1", fan_in_uniform(m))?;
            (wi_0, Some(wi_1))
        } else {
            (vb.get_with_hints((m, f), "wi", fan_in_uniform(m))?, None)
        };
        let wo = vb.get_with_hints((f, m), "wo", fan_in_uniform(f))?;
        Ok(Self {
            wi,
            wi_linear,
            wo,
            dropout: Dropout::from_builder(config.dropout_rate, config),
        })
    }

    pub fn is_gated(&self) -> bool {
        self.wi_linear.is_some()
    }

    /// `[B, L, M]` → `[B, L, M]`.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = linear_last(x, &self.wi)?;
        let h = match &self.wi_linear {
            Some(wi_1) => h.gelu()?.mul(&linear_last(x, wi_1)?)?,
            None => h.relu()?,
        };
        let h = self.dropout.forward_t(&h, train)?;
        linear_last(&h, &self.wo)
    }
}

// ── TransformerFeedForward ──────────────────────────────────────────────────

/// Dense projection with bias.
pub(crate) struct Projection {
    w: Tensor,
    b: Tensor,
}

impl Projection {
    pub(crate) fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let w = vb.get_with_hints((in_dim, out_dim), "w", xavier_uniform(in_dim, out_dim))?;
        let b = vb.get_with_hints(out_dim, "b", Init::Const(0.0))?;
        Ok(Self { w, b })
    }

    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        linear_last(x, &self.w)?.broadcast_add(&self.b)
    }
}

/// Pre-LN residual feed-forward block of the batch-major transformer.
pub struct TransformerFeedForward {
    ln: NormLayer,
    fc1: Projection,
    fc2: Projection,
    relu_dropout: Dropout,
    residual_dropout: Dropout,
}

impl TransformerFeedForward {
    pub fn new(
        model_dim: usize,
        hidden_dim: usize,
        relu_dropout: f64,
        residual_dropout: f64,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            ln: NormLayer::layer(model_dim, eps, vb.pp("ln"))?,
            fc1: Projection::new(model_dim, hidden_dim, vb.pp("fc1"))?,
            fc2: Projection::new(hidden_dim, model_dim, vb.pp("fc2"))?,
            relu_dropout: Dropout::new(relu_dropout),
            residual_dropout: Dropout::new(residual_dropout),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.fc1.forward(&self.ln.forward(x)?)?.relu()?;
        let h = self.relu_dropout.forward_t(&h, train)?;
        let h = self.fc2.forward(&h)?;
        let h = self.residual_dropout.forward_t(&h, train)?;
        x + h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> BuilderConfig {
        BuilderConfig {
            model_dim: 4,
            ff_dim: 6,
            ..Default::default()
        }
    }

    #[test]
    fn dense_relu_dense_matches_manual() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ffn = DenseReluDense::new(&small_config(), false, vb.pp("ffn")).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 4), &Device::Cpu).unwrap();
        let y = ffn.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 3, 4]);

        let data = varmap.data().lock().unwrap();
        let wi = data["ffn.w.wi"].as_tensor().clone();
        let wo = data["ffn.w.wo"].as_tensor().clone();
        let expected = x
            .reshape((6, 4))
            .unwrap()
            .matmul(&wi)
            .unwrap()
            .relu()
            .unwrap()
            .matmul(&wo)
            .unwrap()
            .reshape((2, 3, 4))
            .unwrap();
        let diff = (y - expected).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn gated_gelu_has_two_input_matrices() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ffn = DenseReluDense::new(&small_config(), true, vb.pp("ffn")).unwrap();
        assert!(ffn.is_gated());
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("ffn.w.wi_0") && data.contains_key("ffn.w.wi_1"));
        assert_eq!(data["ffn.w.wo"].as_tensor().dims(), &[6, 4]);
    }

    #[test]
    fn uniform_init_is_bounded() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DenseReluDense::new(&small_config(), false, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        let bound = (3.0f32 / 4.0).sqrt();
        let max = data["w.wi"].as_tensor().abs().unwrap().max_all().unwrap();
        assert!(max.to_scalar::<f32>().unwrap() <= bound);
    }

    #[test]
    fn transformer_ffn_is_residual() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ffn = TransformerFeedForward::new(4, 8, 0.0, 0.0, 1e-6, vb).unwrap();
        // Zero fc2 so the block reduces to the identity.
        {
            let data = varmap.data().lock().unwrap();
            let w = &data["fc2.w"];
            w.set(&w.as_tensor().zeros_like().unwrap()).unwrap();
        }
        let x = Tensor::randn(0f32, 1f32, (1, 2, 4), &Device::Cpu).unwrap();
        let y = ffn.forward_t(&x, false).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }
}
