//! Block-wise local causal attention.
//!
//! Queries are cut into blocks of `block_size`. Block `u` attends to a context
//! window of `block_size + left_context - 1 + right_context` keys starting
//! `left_context - 1` positions before the block. Inside the window, query `i`
//! sees key `j` iff `i - left_context + 1 <= j <= i + right_context`, which is
//! the same for every block, so one `[W, C]` mask serves them all.

use candle_core::{DType, Result, Tensor, D};

use crate::ops::{apply_padding, LARGE_NEGATIVE};

/// Block and window sizes.
#[derive(Debug, Clone, Copy)]
pub struct LocalWindow {
    pub block_size: usize,
    pub left_context: usize,
    pub right_context: usize,
}

impl LocalWindow {
    pub fn context_size(&self) -> usize {
        self.block_size + self.left_context - 1 + self.right_context
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.left_context == 0 {
            candle_core::bail!(
                "local attention needs block_size >= 1 and left_context >= 1, got {self:?}"
            );
        }
        Ok(())
    }

    /// `[W, C]` in-window padding: 1.0 where the key is outside the query's range.
    fn window_padding(&self, device: &candle_core::Device) -> Result<Tensor> {
        let (w, c) = (self.block_size, self.context_size());
        let reach = self.left_context - 1 + self.right_context;
        let data: Vec<f32> = (0..w)
            .flat_map(|r| (0..c).map(move |col| if col >= r && col <= r + reach { 0.0 } else { 1.0 }))
            .collect();
        Tensor::from_vec(data, (w, c), device)
    }
}

/// Zero-pad `x: [B, N, T, H]` along time.
fn pad_time(x: &Tensor, before: usize, after: usize) -> Result<Tensor> {
    let (b, n, _, h) = x.dims4()?;
    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        parts.push(Tensor::zeros((b, n, before, h), x.dtype(), x.device())?);
    }
    parts.push(x.clone());
    if after > 0 {
        parts.push(Tensor::zeros((b, n, after, h), x.dtype(), x.device())?);
    }
    Tensor::cat(&parts, 2)
}

/// Local causal attention over `q, k, v: [B, N, T, H]` (queries already
/// scaled). `paddings: [B, T]` marks padded keys with 1.0.
///
/// Returns the context `[B, N, T, H]` and blocked probabilities
/// `[B, N, U, W, C]` with `U = ceil(T / W)`.
pub fn local_causal_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    paddings: Option<&Tensor>,
    window: LocalWindow,
) -> Result<(Tensor, Tensor)> {
    window.validate()?;
    let (b, _, t, _) = q.dims4()?;
    let device = q.device();
    let w = window.block_size;
    let c = window.context_size();
    let num_blocks = t.div_ceil(w);
    let padded_len = num_blocks * w;
    let before = window.left_context - 1;
    let after = padded_len - t + window.right_context;

    let q = pad_time(q, 0, padded_len - t)?;
    let k = pad_time(k, before, after)?;
    let v = pad_time(v, before, after)?;
    let key_paddings = {
        let real = match paddings {
            Some(p) => p.to_dtype(DType::F32)?,
            None => Tensor::zeros((b, t), DType::F32, device)?,
        };
        let mut parts = Vec::with_capacity(3);
        if before > 0 {
            parts.push(Tensor::ones((b, before), DType::F32, device)?);
        }
        parts.push(real);
        if after > 0 {
            parts.push(Tensor::ones((b, after), DType::F32, device)?);
        }
        Tensor::cat(&parts, 1)?
    };
    let in_window = window.window_padding(device)?.reshape((1, 1, w, c))?;

    let mut contexts = Vec::with_capacity(num_blocks);
    let mut probs = Vec::with_capacity(num_blocks);
    for u in 0..num_blocks {
        let qu = q.narrow(2, u * w, w)?.contiguous()?;
        let ku = k.narrow(2, u * w, c)?.contiguous()?;
        let vu = v.narrow(2, u * w, c)?.contiguous()?;
        let logits = qu.matmul(&ku.transpose(2, 3)?.contiguous()?)?;
        let padding = key_paddings
            .narrow(1, u * w, c)?
            .reshape((b, 1, 1, c))?
            .broadcast_maximum(&in_window)?;
        let logits = apply_padding(&logits, &padding, LARGE_NEGATIVE)?;
        let p = candle_nn::ops::softmax(&logits, D::Minus1)?;
        contexts.push(p.matmul(&vu)?);
        probs.push(p);
    }
    let context = Tensor::cat(&contexts, 2)?.narrow(2, 0, t)?;
    let probs = Tensor::stack(&probs, 2)?;
    Ok((context, probs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::local_causal_padding;
    use candle_core::Device;

    fn full_reference(q: &Tensor, k: &Tensor, v: &Tensor, left: usize, right: usize) -> Tensor {
        let t = q.dim(2).unwrap();
        let logits = q.matmul(&k.transpose(2, 3).unwrap().contiguous().unwrap()).unwrap();
        let pad = local_causal_padding(t, left, right, &Device::Cpu).unwrap();
        let logits = apply_padding(&logits, &pad, LARGE_NEGATIVE).unwrap();
        let p = candle_nn::ops::softmax(&logits, D::Minus1).unwrap();
        p.matmul(v).unwrap()
    }

    fn check(t: usize, window: LocalWindow) {
        let q = Tensor::randn(0f32, 1f32, (2, 2, t, 3), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1f32, (2, 2, t, 3), &Device::Cpu).unwrap();
        let v = Tensor::randn(0f32, 1f32, (2, 2, t, 3), &Device::Cpu).unwrap();
        let (ctx, probs) = local_causal_attention(&q, &k, &v, None, window).unwrap();
        let expected = full_reference(&q, &k, &v, window.left_context, window.right_context);
        let diff = (ctx - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "max diff {diff}");
        assert_eq!(
            probs.dims(),
            &[2, 2, t.div_ceil(window.block_size), window.block_size, window.context_size()]
        );
    }

    #[test]
    fn matches_full_attention_with_lookahead() {
        check(
            7,
            LocalWindow {
                block_size: 3,
                left_context: 3,
                right_context: 1,
            },
        );
    }

    #[test]
    fn matches_full_attention_causal_only() {
        check(
            8,
            LocalWindow {
                block_size: 4,
                left_context: 2,
                right_context: 0,
            },
        );
    }

    #[test]
    fn padded_keys_get_no_weight() {
        let q = Tensor::randn(0f32, 1f32, (1, 1, 4, 2), &Device::Cpu).unwrap();
        let paddings = Tensor::new(&[[0f32, 1., 0., 0.]], &Device::Cpu).unwrap();
        let window = LocalWindow {
            block_size: 2,
            left_context: 2,
            right_context: 0,
        };
        let (_, probs) = local_causal_attention(&q, &q, &q, Some(&paddings), window).unwrap();
        // Block 1, row 0 is query 2; its window column 0 is key 1 (padded).
        let p = probs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let (w, c) = (2, window.context_size());
        assert_eq!(p[w * c], 0.0);
        assert!((p[w * c + 1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_zero_left_context() {
        let x = Tensor::zeros((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let window = LocalWindow {
            block_size: 2,
            left_context: 0,
            right_context: 0,
        };
        assert!(local_causal_attention(&x, &x, &x, None, window).is_err());
    }
}
