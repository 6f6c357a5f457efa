//! Relative position terms for batch-major attention.
//!
//! * [`XlRelative`] — Transformer-XL: sinusoidal embeddings of `i - j`
//!   projected per head, with learned content (`u`) and position (`v`) biases.
//! * [`RpeRelative`] — learned key/value embeddings indexed by the clipped
//!   distance `j - i`.
//!
//! Both work on head-major tensors (`[B, N, T, H]`). A query at row `t` sits at
//! absolute position `q_offset + t`; keys sit at `0..S`. Incremental decoding
//! passes `q_offset = time_step` with a single query row.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

use crate::ops::{gaussian, xavier_uniform};

/// Sinusoidal embedding `[L, dim]` of `positions: [L]`: sines in the first
/// half, cosines in the second, timescales spaced geometrically from 1 to 1e4.
pub fn sinusoid_embedding(positions: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    if half == 0 {
        candle_core::bail!("sinusoid embedding dim must be >= 2, got {dim}");
    }
    let log_inc = (1.0e4f64).ln() / (half.max(2) - 1) as f64;
    let inv: Vec<f32> = (0..half)
        .map(|k| (-(k as f64) * log_inc).exp() as f32)
        .collect();
    let inv = Tensor::from_vec(inv, (1, half), positions.device())?;
    let scaled = positions
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .broadcast_mul(&inv)?;
    let emb = Tensor::cat(&[scaled.sin()?, scaled.cos()?], 1)?;
    if dim % 2 == 1 {
        let pad = Tensor::zeros((emb.dim(0)?, 1), DType::F32, positions.device())?;
        return Tensor::cat(&[emb, pad], 1);
    }
    Ok(emb)
}

// ── Transformer-XL ──────────────────────────────────────────────────────────

pub struct XlRelative {
    pos_proj: Tensor,
    u: Tensor,
    v: Tensor,
    emb_dim: usize,
    skip_term_b: bool,
}

impl XlRelative {
    pub fn new(
        emb_dim: usize,
        num_heads: usize,
        dim_per_head: usize,
        skip_term_b: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = num_heads * dim_per_head;
        let pos_proj = vb.get_with_hints(
            (emb_dim, num_heads, dim_per_head),
            "pos_proj",
            xavier_uniform(emb_dim, hidden),
        )?;
        let stdev = 1.0 / (dim_per_head as f64).sqrt();
        let u = vb.get_with_hints((num_heads, dim_per_head), "u", gaussian(stdev))?;
        let v = vb.get_with_hints((num_heads, dim_per_head), "v", gaussian(stdev))?;
        Ok(Self {
            pos_proj,
            u,
            v,
            emb_dim,
            skip_term_b,
        })
    }

    /// `(q + u)·k + (q + v)·r(i - j)`, or `v·r` for the position term when
    /// `skip_term_b` is set. `q: [B, N, T, H]`, `k: [B, N, S, H]` → `[B, N, T, S]`.
    pub fn logits(&self, q: &Tensor, k: &Tensor, q_offset: usize) -> Result<Tensor> {
        let (b, n, t, h) = q.dims4()?;
        let s = k.dim(2)?;
        let device = q.device();
        let q = q.contiguous()?;

        let u = self.u.reshape((1, n, 1, h))?;
        let term_ac = q
            .broadcast_add(&u)?
            .matmul(&k.transpose(2, 3)?.contiguous()?)?;

        // Every distance i - j that occurs, from q_offset - (S - 1) upwards.
        let l = t + s - 1;
        let lo = q_offset as f64 - (s as f64 - 1.0);
        let positions = Tensor::arange(0u32, l as u32, device)?
            .to_dtype(DType::F32)?
            .affine(1.0, lo)?;
        let r = sinusoid_embedding(&positions, self.emb_dim)?
            .matmul(&self.pos_proj.reshape((self.emb_dim, n * h))?)?
            .reshape((l, n, h))?
            .permute((1, 2, 0))?
            .contiguous()?;

        let v = self.v.reshape((1, n, 1, h))?;
        let qv = if self.skip_term_b {
            v.broadcast_as((b, n, t, h))?.contiguous()?
        } else {
            q.broadcast_add(&v)?
        };
        let term_bd = qv.broadcast_matmul(&r.unsqueeze(0)?)?;
        let index = distance_index(t, s, device)?
            .broadcast_as((b, n, t, s))?
            .contiguous()?;
        let term_bd = term_bd.contiguous()?.gather(&index, 3)?;
        term_ac + term_bd
    }
}

/// `[T, S]` gather index `t - s + S - 1` into the table of distances.
fn distance_index(t: usize, s: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u32> = (0..t)
        .flat_map(|i| (0..s).map(move |j| (i + s - 1 - j) as u32))
        .collect();
    Tensor::from_vec(data, (t, s), device)
}

// ── RPE ─────────────────────────────────────────────────────────────────────

pub struct RpeRelative {
    key_emb: Tensor,
    value_emb: Tensor,
    radius: usize,
}

impl RpeRelative {
    pub fn new(radius: usize, num_heads: usize, dim_per_head: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = num_heads * dim_per_head;
        let rows = 2 * radius + 1;
        let init = gaussian(1.0 / (hidden as f64).sqrt());
        let key_emb = vb.get_with_hints((rows, hidden), "key_emb", init)?;
        let value_emb = vb.get_with_hints((rows, hidden), "value_emb", init)?;
        Ok(Self {
            key_emb,
            value_emb,
            radius,
        })
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// `[T·S]` row ids `clip(j - i, -R, R) + R`.
    pub fn relative_index(&self, t: usize, s: usize, q_offset: usize, device: &Device) -> Result<Tensor> {
        let r = self.radius as i64;
        let data: Vec<u32> = (0..t)
            .flat_map(|i| {
                let qi = (q_offset + i) as i64;
                (0..s).map(move |j| ((j as i64 - qi).clamp(-r, r) + r) as u32)
            })
            .collect();
        Tensor::from_vec(data, t * s, device)
    }

    /// Embeddings for every (query, key) pair, laid out `[N, T, S, H]`.
    fn lookup(&self, table: &Tensor, n: usize, t: usize, s: usize, q_offset: usize) -> Result<Tensor> {
        let hidden = table.dim(1)?;
        let index = self.relative_index(t, s, q_offset, table.device())?;
        table
            .index_select(&index, 0)?
            .reshape((t, s, n, hidden / n))?
            .permute((2, 0, 1, 3))?
            .contiguous()
    }

    /// `q·(k + ek)`: `[B, N, T, H]`, `[B, N, S, H]` → `[B, N, T, S]`.
    pub fn logits(&self, q: &Tensor, k: &Tensor, q_offset: usize) -> Result<Tensor> {
        let (_, n, t, _) = q.dims4()?;
        let s = k.dim(2)?;
        let q = q.contiguous()?;
        let base = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let ek = self
            .lookup(&self.key_emb, n, t, s, q_offset)?
            .transpose(2, 3)?
            .contiguous()?;
        let rel = q
            .permute((1, 2, 0, 3))?
            .contiguous()?
            .matmul(&ek)?
            .permute((2, 0, 1, 3))?;
        base + rel
    }

    /// `Σ_j p·(v + ev)`: `[B, N, T, S]`, `[B, N, S, H]` → `[B, N, T, H]`.
    pub fn context(&self, probs: &Tensor, v: &Tensor, q_offset: usize) -> Result<Tensor> {
        let (_, n, t, s) = probs.dims4()?;
        let probs = probs.contiguous()?;
        let base = probs.matmul(&v.contiguous()?)?;
        let ev = self.lookup(&self.value_emb, n, t, s, q_offset)?;
        let rel = probs
            .permute((1, 2, 0, 3))?
            .contiguous()?
            .matmul(&ev)?
            .permute((2, 0, 1, 3))?;
        base + rel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use candle_nn::{Init, VarMap};

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

    #[test]
    fn sinusoid_at_zero_is_sin0_cos1() {
        let pos = Tensor::new(&[0f32, 1.], &Device::Cpu).unwrap();
        let emb = sinusoid_embedding(&pos, 4).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(emb[0], vec![0., 0., 1., 1.]);
        // First timescale is 1: sin(1), then the slowest timescale 1e-4.
        assert!((emb[1][0] - 1f32.sin()).abs() < 1e-6);
        assert!((emb[1][1] - 1e-4f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn xl_single_step_matches_full_rows() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xl = XlRelative::new(6, 2, 3, false, vb).unwrap();
        let q = Tensor::randn(0f32, 1f32, (1, 2, 4, 3), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1f32, (1, 2, 4, 3), &Device::Cpu).unwrap();
        let full = xl.logits(&q, &k, 0).unwrap();
        for t in 0..4 {
            let step = xl
                .logits(&q.narrow(2, t, 1).unwrap(), &k.narrow(2, 0, t + 1).unwrap(), t)
                .unwrap();
            let expected = full.i((.., .., t..t + 1, 0..t + 1)).unwrap();
            assert!(max_diff(&step, &expected) < 1e-4);
        }
    }

    #[test]
    fn xl_skip_term_b_ignores_query_in_position_term() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xl = XlRelative::new(4, 1, 2, true, vb).unwrap();
        let k = Tensor::zeros((1, 1, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let q1 = Tensor::randn(0f32, 1f32, (1, 1, 3, 2), &Device::Cpu).unwrap();
        let q2 = Tensor::randn(0f32, 1f32, (1, 1, 3, 2), &Device::Cpu).unwrap();
        // With zero keys only the position term remains, and it no longer
        // depends on the query.
        let a = xl.logits(&q1, &k, 0).unwrap();
        let b = xl.logits(&q2, &k, 0).unwrap();
        assert!(max_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn rpe_clips_distance() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let rpe = RpeRelative::new(1, 1, 2, vb).unwrap();
        let idx = rpe.relative_index(1, 5, 2, &Device::Cpu).unwrap();
        assert_eq!(idx.to_vec1::<u32>().unwrap(), vec![0, 0, 1, 2, 2]);
    }

    #[test]
    fn rpe_single_step_matches_full_rows() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let rpe = RpeRelative::new(2, 2, 3, vb).unwrap();
        let q = Tensor::randn(0f32, 1f32, (2, 2, 5, 3), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1f32, (2, 2, 5, 3), &Device::Cpu).unwrap();
        let v = Tensor::randn(0f32, 1f32, (2, 2, 5, 3), &Device::Cpu).unwrap();
        let full = rpe.logits(&q, &k, 0).unwrap();
        for t in 0..5 {
            let qt = q.narrow(2, t, 1).unwrap();
            let kt = k.narrow(2, 0, t + 1).unwrap();
            let step = rpe.logits(&qt, &kt, t).unwrap();
            let expected = full.i((.., .., t..t + 1, 0..t + 1)).unwrap();
            assert!(max_diff(&step, &expected) < 1e-4);

            let probs = candle_nn::ops::softmax_last_dim(&step).unwrap();
            let ctx = rpe.context(&probs, &v.narrow(2, 0, t + 1).unwrap(), t).unwrap();
            assert_eq!(ctx.dims(), &[2, 2, 1, 3]);
        }
        // Zero embeddings reduce to plain dot-product attention.
        let varmap = VarMap::new();
        varmap
            .get((5, 6), "key_emb", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get((5, 6), "value_emb", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let plain = RpeRelative::new(2, 2, 3, vb).unwrap();
        let logits = plain.logits(&q, &k, 0).unwrap();
        let dot = q.matmul(&k.transpose(2, 3).unwrap().contiguous().unwrap()).unwrap();
        assert!(max_diff(&logits, &dot) < 1e-5);
    }
}
