//! Batch-major multi-headed attention.
//!
//! Inputs are `[B, T, D]`; projections produce `[B, T, N, H]` (N heads of
//! H dims each); logits and probabilities are `[B, N, T, S]`.
//!
//! | Kind | Logits | Context |
//! |------|--------|---------|
//! | `Dot` | `q·k` | `Σ p·v` |
//! | `Xl` | `(q+u)·k + (q+v)·r(i-j)` | `Σ p·v` |
//! | `Rpe` | `q·(k + ek)` | `Σ p·(v + ev)` |
//! | `LocalCausal` | blocked `q·k` | blocked `Σ p·v` |
//! | `LocalCausalXl` | XL logits, local window mask | `Σ p·v` |
//!
//! Incremental decoding appends one key/value per step to an
//! [`AttentionState`] and attends over everything cached so far.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use gshard_common::{AttentionConfig, AttentionKind};

use crate::local::{local_causal_attention, LocalWindow};
use crate::masks::local_causal_padding;
use crate::ops::{apply_padding, xavier_uniform, Dropout, LARGE_NEGATIVE};
use crate::relative::{RpeRelative, XlRelative};

/// `1 / softplus(0)`: makes a zero-initialised per-dim scale start at 1.
const R_SOFTPLUS_0: f64 = 1.442695041;

// ── AttentionState ──────────────────────────────────────────────────────────

/// Per-layer key/value cache for incremental decoding.
///
/// Keys and values are stored batch-major, `[B, S, N, H]`, and grow by one
/// position per decode step.
#[derive(Debug, Default, Clone)]
pub struct AttentionState {
    key: Option<Tensor>,
    value: Option<Tensor>,
}

impl AttentionState {
    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.key
            .as_ref()
            .map(|t| t.dim(1).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append keys and values of shape `[B, T, N, H]`.
    pub fn append(&mut self, k: Tensor, v: Tensor) -> Result<()> {
        match (self.key.take(), self.value.take()) {
            (Some(key), Some(value)) => {
                self.key = Some(Tensor::cat(&[&key, &k], 1)?);
                self.value = Some(Tensor::cat(&[&value, &v], 1)?);
            }
            _ => {
                self.key = Some(k);
                self.value = Some(v);
            }
        }
        Ok(())
    }

    pub fn key(&self) -> Option<&Tensor> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

// ── Projections ─────────────────────────────────────────────────────────────

/// `[B, T, D]` → `[B, T, N, H]` with weights `w: [D, N, H]` and bias `b: [N, H]`.
struct HeadsProjection {
    w: Tensor,
    b: Option<Tensor>,
    num_heads: usize,
    dim_per_head: usize,
}

impl HeadsProjection {
    fn new(input_dim: usize, num_heads: usize, dim_per_head: usize, use_bias: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = num_heads * dim_per_head;
        let w = vb.get_with_hints(
            (input_dim, num_heads, dim_per_head),
            "w",
            xavier_uniform(input_dim, hidden),
        )?;
        let b = if use_bias {
            Some(vb.get_with_hints((num_heads, dim_per_head), "b", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self {
            w,
            b,
            num_heads,
            dim_per_head,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, d) = x.dims3()?;
        let hidden = self.num_heads * self.dim_per_head;
        let y = x
            .reshape((b * t, d))?
            .matmul(&self.w.reshape((d, hidden))?)?
            .reshape((b, t, self.num_heads, self.dim_per_head))?;
        match &self.b {
            Some(bias) => y.broadcast_add(bias),
            None => Ok(y),
        }
    }
}

/// `[B, T, N, H]` → `[B, T, D]` with weights `w: [D, N, H]` and bias `b: [D]`.
struct PostProjection {
    w: Tensor,
    b: Option<Tensor>,
}

impl PostProjection {
    fn new(input_dim: usize, num_heads: usize, dim_per_head: usize, use_bias: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = num_heads * dim_per_head;
        let w = vb.get_with_hints(
            (input_dim, num_heads, dim_per_head),
            "w",
            xavier_uniform(hidden, input_dim),
        )?;
        let b = if use_bias {
            Some(vb.get_with_hints(input_dim, "b", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self { w, b })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, n, h) = x.dims4()?;
        let d = self.w.dim(0)?;
        let y = x
            .reshape((b * t, n * h))?
            .matmul(&self.w.reshape((d, n * h))?.t()?)?
            .reshape((b, t, d))?;
        match &self.b {
            Some(bias) => y.broadcast_add(bias),
            None => Ok(y),
        }
    }
}

enum Relative {
    None,
    Xl(XlRelative),
    Rpe(RpeRelative),
}

// ── MultiHeadedAttention ────────────────────────────────────────────────────

pub struct MultiHeadedAttention {
    config: AttentionConfig,
    query: HeadsProjection,
    key: HeadsProjection,
    value: HeadsProjection,
    post: PostProjection,
    per_dim_scale: Option<Tensor>,
    relative: Relative,
    dropout: Dropout,
    num_heads: usize,
    dim_per_head: usize,
}

impl MultiHeadedAttention {
    pub fn new(config: &AttentionConfig, vb: VarBuilder) -> Result<Self> {
        let (d, n) = (config.input_dim, config.num_heads);
        let h = config
            .dim_per_head()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let per_dim_scale = if config.enable_per_dim_scale {
            Some(vb.get_with_hints(h, "per_dim_scale", Init::Const(0.0))?)
        } else {
            None
        };
        let relative = match &config.kind {
            AttentionKind::Xl {
                rel_pos_emb_dim,
                skip_term_b,
            }
            | AttentionKind::LocalCausalXl {
                rel_pos_emb_dim,
                skip_term_b,
                ..
            } => Relative::Xl(XlRelative::new(*rel_pos_emb_dim, n, h, *skip_term_b, vb.clone())?),
            AttentionKind::Rpe { radius } => Relative::Rpe(RpeRelative::new(*radius, n, h, vb.clone())?),
            AttentionKind::Dot | AttentionKind::LocalCausal { .. } => Relative::None,
        };
        Ok(Self {
            query: HeadsProjection::new(d, n, h, config.use_bias, vb.pp("query"))?,
            key: HeadsProjection::new(d, n, h, config.use_bias, vb.pp("key"))?,
            value: HeadsProjection::new(d, n, h, config.use_bias, vb.pp("value"))?,
            post: PostProjection::new(d, n, h, config.use_bias, vb.pp("post"))?,
            per_dim_scale,
            relative,
            dropout: Dropout::new(config.atten_dropout_prob),
            num_heads: n,
            dim_per_head: h,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn dim_per_head(&self) -> usize {
        self.dim_per_head
    }

    /// Scale `[B, T, N, H]` queries by `H^-½`, or by the learned per-dim scale.
    fn scale_query(&self, q: &Tensor) -> Result<Tensor> {
        let base = 1.0 / (self.dim_per_head as f64).sqrt();
        match &self.per_dim_scale {
            Some(p) => {
                let softplus = (p.exp()? + 1.0)?.log()?;
                q.broadcast_mul(&(softplus * (base * R_SOFTPLUS_0))?)
            }
            None => q * base,
        }
    }

    /// Logits `[B, N, T, S]` from head-major `q: [B, N, T, H]`, `k: [B, N, S, H]`.
    fn logits(&self, q: &Tensor, k: &Tensor, q_offset: usize) -> Result<Tensor> {
        match &self.relative {
            Relative::Xl(xl) => xl.logits(q, k, q_offset),
            Relative::Rpe(rpe) => rpe.logits(q, k, q_offset),
            Relative::None => q.contiguous()?.matmul(&k.transpose(2, 3)?.contiguous()?),
        }
    }

    fn context(&self, probs: &Tensor, v: &Tensor, q_offset: usize) -> Result<Tensor> {
        match &self.relative {
            Relative::Rpe(rpe) => rpe.context(probs, v, q_offset),
            _ => probs.contiguous()?.matmul(&v.contiguous()?),
        }
    }

    /// Probabilities `[B, N, T, S]` from projected `query: [B, T, N, H]` and
    /// `key: [B, S, N, H]`. Logits are not scaled here.
    ///
    /// `paddings: [B, S]` and `per_step_padding: [B, T, S]` mark hidden keys
    /// (1.0); `segment_mask: [B, 1, T, S]` is added to the logits.
    pub fn atten_probs(
        &self,
        query: &Tensor,
        key: &Tensor,
        paddings: Option<&Tensor>,
        segment_mask: Option<&Tensor>,
        per_step_padding: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = query.permute((0, 2, 1, 3))?;
        let k = key.permute((0, 2, 1, 3))?;
        let logits = self.logits(&q, &k, 0)?;
        masked_softmax(&logits, paddings, segment_mask, per_step_padding)
    }

    /// Attend from `query_vec: [B, T, D]` over `key_vec`/`value_vec: [B, S, D]`.
    ///
    /// Returns the context `[B, T, D]` and the attention probabilities
    /// (`[B, N, T, S]`, or `[B, N, U, W, C]` blocks for local attention).
    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        query_vec: &Tensor,
        key_vec: &Tensor,
        value_vec: &Tensor,
        paddings: Option<&Tensor>,
        segment_mask: Option<&Tensor>,
        per_step_padding: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        if self.config.packed_input && segment_mask.is_none() {
            candle_core::bail!("packed_input attention requires a segment mask");
        }
        let q = self.scale_query(&self.query.forward(query_vec)?)?.permute((0, 2, 1, 3))?;
        let k = self.key.forward(key_vec)?.permute((0, 2, 1, 3))?;
        let v = self.value.forward(value_vec)?.permute((0, 2, 1, 3))?;

        let (ctx, probs) = match &self.config.kind {
            AttentionKind::LocalCausal {
                block_size,
                left_context,
                right_context,
            } => {
                if segment_mask.is_some() || per_step_padding.is_some() {
                    candle_core::bail!("local causal attention takes key paddings only");
                }
                let window = LocalWindow {
                    block_size: *block_size,
                    left_context: *left_context,
                    right_context: *right_context,
                };
                local_causal_attention(&q, &k, &v, paddings, window)?
            }
            AttentionKind::LocalCausalXl {
                left_context,
                right_context,
                ..
            } => {
                let (b, _, t, _) = q.dims4()?;
                if k.dim(2)? != t {
                    candle_core::bail!("local attention requires self-attention, got {t} queries");
                }
                let window = local_causal_padding(t, *left_context, *right_context, q.device())?
                    .unsqueeze(0)?
                    .broadcast_as((b, t, t))?;
                let step = match per_step_padding {
                    Some(p) => p.to_dtype(DType::F32)?.broadcast_maximum(&window)?,
                    None => window,
                };
                let logits = self.logits(&q, &k, 0)?;
                let probs = masked_softmax(&logits, paddings, segment_mask, Some(&step))?;
                let dropped = self.dropout.forward_t(&probs, train)?;
                (self.context(&dropped, &v, 0)?, probs)
            }
            _ => {
                let logits = self.logits(&q, &k, 0)?;
                let probs = masked_softmax(&logits, paddings, segment_mask, per_step_padding)?;
                let dropped = self.dropout.forward_t(&probs, train)?;
                (self.context(&dropped, &v, 0)?, probs)
            }
        };
        let ctx = self.post.forward(&ctx.permute((0, 2, 1, 3))?.contiguous()?)?;
        Ok((ctx, probs))
    }

    /// One decoding step of causal self-attention.
    ///
    /// `query_vec: [B, D]` is the new position; its key and value are appended
    /// to `state` and it attends over all cached positions. `paddings: [B, S]`
    /// covers the cache after the append. Returns `[B, D]`.
    pub fn extend_step(
        &self,
        state: &mut AttentionState,
        query_vec: &Tensor,
        paddings: Option<&Tensor>,
    ) -> Result<Tensor> {
        let time_step = state.len();
        let x = query_vec.unsqueeze(1)?;
        let q = self.scale_query(&self.query.forward(&x)?)?.permute((0, 2, 1, 3))?;
        state.append(self.key.forward(&x)?, self.value.forward(&x)?)?;
        let (key, value) = match (state.key(), state.value()) {
            (Some(k), Some(v)) => (k.permute((0, 2, 1, 3))?, v.permute((0, 2, 1, 3))?),
            _ => candle_core::bail!("attention state is empty after append"),
        };
        let s = key.dim(2)?;

        // Keys beyond the local window are hidden.
        let window_padding = match &self.config.kind {
            AttentionKind::LocalCausal {
                left_context,
                right_context,
                ..
            }
            | AttentionKind::LocalCausalXl {
                left_context,
                right_context,
                ..
            } => {
                if *right_context > 0 {
                    candle_core::bail!("extend_step does not support right_context > 0");
                }
                let first_visible = (time_step + 1).saturating_sub(*left_context);
                let data: Vec<f32> = (0..s).map(|j| if j < first_visible { 1.0 } else { 0.0 }).collect();
                Some(Tensor::from_vec(data, (1, 1, 1, s), query_vec.device())?)
            }
            _ => None,
        };

        let mut logits = self.logits(&q, &key, time_step)?;
        if let Some(pad) = &window_padding {
            logits = apply_padding(&logits, pad, LARGE_NEGATIVE)?;
        }
        let probs = masked_softmax(&logits, paddings, None, None)?;
        let ctx = self.context(&probs, &value, time_step)?;
        let ctx = self.post.forward(&ctx.permute((0, 2, 1, 3))?.contiguous()?)?;
        ctx.squeeze(1)
    }
}

/// Add the segment mask, replace padded positions by `LARGE_NEGATIVE` and
/// softmax over keys.
fn masked_softmax(
    logits: &Tensor,
    paddings: Option<&Tensor>,
    segment_mask: Option<&Tensor>,
    per_step_padding: Option<&Tensor>,
) -> Result<Tensor> {
    let (b, _, _, s) = logits.dims4()?;
    let mut logits = match segment_mask {
        Some(m) => logits.broadcast_add(&m.to_dtype(logits.dtype())?)?,
        None => logits.clone(),
    };
    let mut padding = match paddings {
        Some(p) => Some(p.to_dtype(DType::F32)?.reshape((b, 1, 1, s))?),
        None => None,
    };
    if let Some(step) = per_step_padding {
        let step = step.to_dtype(DType::F32)?.unsqueeze(1)?;
        padding = Some(match padding {
            Some(p) => p.broadcast_maximum(&step)?,
            None => step,
        });
    }
    if let Some(p) = padding {
        logits = apply_padding(&logits, &p, LARGE_NEGATIVE)?;
    }
    candle_nn::ops::softmax(&logits, D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::causal_padding;
    use candle_core::{Device, IndexOp};
    use candle_nn::VarMap;

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn build(config: &AttentionConfig) -> MultiHeadedAttention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MultiHeadedAttention::new(config, vb).unwrap()
    }

    #[test]
    fn atten_probs_matches_manual_softmax() {
        let mha = build(&AttentionConfig::new(4, 4, 2));
        let q = Tensor::randn(0f32, 1f32, (1, 2, 2, 2), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1f32, (1, 3, 2, 2), &Device::Cpu).unwrap();
        let paddings = Tensor::new(&[[0f32, 0., 1.]], &Device::Cpu).unwrap();
        let probs = mha.atten_probs(&q, &k, Some(&paddings), None, None).unwrap();
        assert_eq!(probs.dims(), &[1, 2, 2, 3]);

        let qv = q.squeeze(0).unwrap().to_vec3::<f32>().unwrap();
        let kv = k.squeeze(0).unwrap().to_vec3::<f32>().unwrap();
        let pv = probs.squeeze(0).unwrap().to_vec3::<f32>().unwrap();
        for n in 0..2 {
            for t in 0..2 {
                let logits: Vec<f32> = (0..2)
                    .map(|s| (0..2).map(|h| qv[t][n][h] * kv[s][n][h]).sum())
                    .collect();
                let m = logits[0].max(logits[1]);
                let z: f32 = logits.iter().map(|l| (l - m).exp()).sum();
                for s in 0..2 {
                    assert!((pv[n][t][s] - (logits[s] - m).exp() / z).abs() < 1e-5);
                }
                assert_eq!(pv[n][t][2], 0.0);
            }
        }
    }

    #[test]
    fn segment_mask_blocks_other_segments() {
        let mut cfg = AttentionConfig::new(4, 4, 1);
        cfg.packed_input = true;
        let mha = build(&cfg);
        let x = Tensor::randn(0f32, 1f32, (1, 3, 4), &Device::Cpu).unwrap();
        let seg = Tensor::new(&[[1u32, 1, 2]], &Device::Cpu).unwrap();
        let mask = crate::masks::segment_mask(&seg, &seg).unwrap();
        let (_, probs) = mha.forward_t(&x, &x, &x, None, Some(&mask), None, false).unwrap();
        let p = probs.i((0, 0)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(p[0][2], 0.0);
        assert_eq!(p[2][0], 0.0);
        assert!((p[2][2] - 1.0).abs() < 1e-6);
        assert!(mha.forward_t(&x, &x, &x, None, None, None, false).is_err());
    }

    fn check_extend_step(kind: AttentionKind) {
        let mut cfg = AttentionConfig::new(6, 6, 2);
        cfg.kind = kind.clone();
        let mha = build(&cfg);
        let t = 5;
        let x = Tensor::randn(0f32, 1f32, (2, t, 6), &Device::Cpu).unwrap();
        let per_step = match kind {
            AttentionKind::LocalCausal { left_context, .. }
            | AttentionKind::LocalCausalXl { left_context, .. } => {
                local_causal_padding(t, left_context, 0, &Device::Cpu).unwrap()
            }
            _ => causal_padding(t, &Device::Cpu).unwrap(),
        };
        let per_step = per_step.unsqueeze(0).unwrap().broadcast_as((2, t, t)).unwrap();
        let full = match kind {
            AttentionKind::LocalCausal { .. } | AttentionKind::LocalCausalXl { .. } => {
                mha.forward_t(&x, &x, &x, None, None, None, false)
            }
            _ => mha.forward_t(&x, &x, &x, None, None, Some(&per_step), false),
        }
        .unwrap()
        .0;

        let mut state = AttentionState::default();
        for step in 0..t {
            let out = mha
                .extend_step(&mut state, &x.i((.., step)).unwrap(), None)
                .unwrap();
            let expected = full.i((.., step)).unwrap();
            assert!(max_diff(&out, &expected) < 1e-4, "{kind:?} step {step}");
        }
        assert_eq!(state.len(), t);
    }

    #[test]
    fn extend_step_matches_causal_forward() {
        check_extend_step(AttentionKind::Dot);
        check_extend_step(AttentionKind::Xl {
            rel_pos_emb_dim: 8,
            skip_term_b: false,
        });
        check_extend_step(AttentionKind::Rpe { radius: 2 });
        check_extend_step(AttentionKind::LocalCausal {
            block_size: 2,
            left_context: 3,
            right_context: 0,
        });
        check_extend_step(AttentionKind::LocalCausalXl {
            block_size: 2,
            left_context: 2,
            right_context: 0,
            rel_pos_emb_dim: 8,
            skip_term_b: true,
        });
    }

    #[test]
    fn zero_per_dim_scale_matches_default_scaling() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let plain = MultiHeadedAttention::new(&AttentionConfig::new(4, 4, 2), vb.clone()).unwrap();
        let mut cfg = AttentionConfig::new(4, 4, 2);
        cfg.enable_per_dim_scale = true;
        let scaled = MultiHeadedAttention::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 3, 4), &Device::Cpu).unwrap();
        let a = plain.forward_t(&x, &x, &x, None, None, None, false).unwrap().0;
        let b = scaled.forward_t(&x, &x, &x, None, None, None, false).unwrap().0;
        assert!(max_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn cross_attention_shapes() {
        let mha = build(&AttentionConfig::new(4, 8, 2));
        let q = Tensor::randn(0f32, 1f32, (2, 3, 4), &Device::Cpu).unwrap();
        let kv = Tensor::randn(0f32, 1f32, (2, 5, 4), &Device::Cpu).unwrap();
        let (ctx, probs) = mha.forward_t(&q, &kv, &kv, None, None, None, false).unwrap();
        assert_eq!(ctx.dims(), &[2, 3, 4]);
        assert_eq!(probs.dims(), &[2, 2, 3, 5]);
        let sums = probs.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn state_append_and_clear() {
        let mut state = AttentionState::default();
        assert!(state.is_empty());
        let kv = Tensor::zeros((1, 2, 1, 3), DType::F32, &Device::Cpu).unwrap();
        state.append(kv.clone(), kv.clone()).unwrap();
        state.append(kv.clone(), kv).unwrap();
        assert_eq!(state.len(), 4);
        state.clear();
        assert!(state.key().is_none());
    }
}
