//! Segment masks, causal paddings and relative position buckets.
//!
//! Packed rows carry `segment_id` (0 = padding) and `segment_pos` (position
//! within the segment). Two mask conventions coexist:
//!
//! | Function | Shape | Convention |
//! |----------|-------|------------|
//! | [`self_attention_bias`] | `[B, L, L]` | additive, `-1e9` where not visible |
//! | [`dec_self_attention_bias`] | `[B, L, M]` | additive, also hides future positions |
//! | [`dec_enc_attention_bias`] | `[B, L, M]` | additive, decoder vs encoder segments |
//! | [`segment_mask`] | `[B, 1, T, S]` | additive, `LARGE_NEGATIVE` across segments |
//! | [`causal_padding`] / [`local_causal_padding`] | `[T, S]` | 1.0 = padded |

use candle_core::{DType, Device, Result, Tensor};

use crate::ops::{LARGE_NEGATIVE, NOT_VISIBLE_BIAS};

/// 1.0 where query segment `a` cannot see key segment `b`: the ids differ, or
/// both are padding. Shapes `[B, L]`, `[B, M]` → `[B, L, M]`.
fn segments_not_visible(q_segment_id: &Tensor, k_segment_id: &Tensor) -> Result<Tensor> {
    let a = q_segment_id.to_dtype(DType::F32)?.unsqueeze(2)?;
    let b = k_segment_id.to_dtype(DType::F32)?.unsqueeze(1)?;
    let differ = a.broadcast_ne(&b)?.to_dtype(DType::F32)?;
    let both_padding = a
        .eq(0f32)?
        .to_dtype(DType::F32)?
        .broadcast_mul(&b.eq(0f32)?.to_dtype(DType::F32)?)?;
    differ.broadcast_add(&both_padding)?.minimum(1f32)
}

/// Encoder self-attention bias from `segment_id: [B, L]`.
pub fn self_attention_bias(segment_id: &Tensor) -> Result<Tensor> {
    segments_not_visible(segment_id, segment_id)? * NOT_VISIBLE_BIAS
}

/// Decoder self-attention bias: segments as in [`self_attention_bias`], plus
/// queries cannot see keys at a later segment position.
///
/// During training queries and keys are the same positions; during decoding
/// the keys are everything cached so far.
pub fn dec_self_attention_bias(
    q_segment_id: &Tensor,
    q_segment_pos: &Tensor,
    k_segment_id: &Tensor,
    k_segment_pos: &Tensor,
) -> Result<Tensor> {
    let segments = segments_not_visible(q_segment_id, k_segment_id)?;
    let qp = q_segment_pos.to_dtype(DType::F32)?.unsqueeze(2)?;
    let kp = k_segment_pos.to_dtype(DType::F32)?.unsqueeze(1)?;
    let future = qp.broadcast_lt(&kp)?.to_dtype(DType::F32)?;
    segments.broadcast_add(&future)?.minimum(1f32)? * NOT_VISIBLE_BIAS
}

/// Decoder-to-encoder attention bias: `[B, L]`, `[B, M]` → `[B, L, M]`.
pub fn dec_enc_attention_bias(dec_segment_id: &Tensor, enc_segment_id: &Tensor) -> Result<Tensor> {
    segments_not_visible(dec_segment_id, enc_segment_id)? * NOT_VISIBLE_BIAS
}

/// Batch-major segment mask `[B, 1, T, S]`: `LARGE_NEGATIVE` where the query
/// and key segment ids differ.
pub fn segment_mask(q_segment_id: &Tensor, k_segment_id: &Tensor) -> Result<Tensor> {
    let a = q_segment_id.to_dtype(DType::F32)?.unsqueeze(2)?;
    let b = k_segment_id.to_dtype(DType::F32)?.unsqueeze(1)?;
    let differ = a.broadcast_ne(&b)?.to_dtype(DType::F32)?;
    (differ * LARGE_NEGATIVE as f64)?.unsqueeze(1)
}

/// `[T, T]` padding that hides keys after the query: 1.0 above the diagonal.
pub fn causal_padding(len: usize, device: &Device) -> Result<Tensor> {
    let lower = Tensor::tril2(len, DType::F32, device)?;
    lower.affine(-1.0, 1.0)
}

/// `[T, T]` padding for local causal attention: query `i` sees keys
/// `i - left_context + 1 ..= i + right_context`.
pub fn local_causal_padding(
    len: usize,
    left_context: usize,
    right_context: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut data = vec![1f32; len * len];
    for i in 0..len {
        let lo = (i + 1).saturating_sub(left_context);
        let hi = (i + right_context).min(len.saturating_sub(1));
        for j in lo..=hi {
            data[i * len + j] = 0.0;
        }
    }
    Tensor::from_vec(data, (len, len), device)
}

// ── Relative position buckets ───────────────────────────────────────────────

/// T5-style relative position buckets.
///
/// `relative_position = key_pos - query_pos`. Exact buckets cover distances
/// below `num_buckets / 2`; larger distances are bucketed logarithmically up
/// to `max_distance`, with everything beyond sharing the last bucket. Without
/// `bidirectional`, keys after the query all map to bucket 0.
pub fn relative_position_bucket(
    relative_position: &Tensor,
    num_buckets: usize,
    max_distance: usize,
    bidirectional: bool,
) -> Result<Tensor> {
    let mut n = relative_position.to_dtype(DType::F32)?.neg()?;
    let mut num_buckets = num_buckets;
    let mut ret = n.zeros_like()?;
    if bidirectional {
        num_buckets /= 2;
        ret = (n.lt(0f32)?.to_dtype(DType::F32)? * num_buckets as f64)?;
        n = n.abs()?;
    } else {
        n = n.maximum(0f32)?;
    }
    let max_exact = (num_buckets / 2) as f64;
    let is_small = n.lt(max_exact)?;
    let scale = (num_buckets as f64 - max_exact) / (max_distance as f64 / max_exact).ln();
    let val_if_large = ((n.maximum(1f32)? / max_exact)?.log()? * scale)?
        .floor()?
        .affine(1.0, max_exact)?
        .minimum((num_buckets - 1) as f32)?;
    let bucket = is_small.where_cond(&n, &val_if_large)?;
    (ret + bucket)?.to_dtype(DType::U32)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(bias: &Tensor) -> Vec<Vec<u8>> {
        bias.squeeze(0)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap()
            .into_iter()
            .map(|row| row.into_iter().map(|v| (v < -1.0) as u8).collect())
            .collect()
    }

    #[test]
    fn self_attention_bias_blocks_segments() {
        let seg = Tensor::new(&[[1u32, 1, 2]], &Device::Cpu).unwrap();
        let bias = self_attention_bias(&seg).unwrap();
        assert_eq!(flags(&bias), vec![vec![0, 0, 1], vec![0, 0, 1], vec![1, 1, 0]]);
    }

    #[test]
    fn padding_never_visible_to_padding() {
        let seg = Tensor::new(&[[1u32, 0, 0]], &Device::Cpu).unwrap();
        let bias = self_attention_bias(&seg).unwrap();
        assert_eq!(flags(&bias), vec![vec![0, 1, 1], vec![1, 1, 1], vec![1, 1, 1]]);
    }

    #[test]
    fn dec_self_attention_bias_is_causal_within_segment() {
        let seg = Tensor::new(&[[1u32, 1, 2]], &Device::Cpu).unwrap();
        let pos = Tensor::new(&[[0u32, 1, 0]], &Device::Cpu).unwrap();
        let bias = dec_self_attention_bias(&seg, &pos, &seg, &pos).unwrap();
        assert_eq!(flags(&bias), vec![vec![0, 1, 1], vec![0, 0, 1], vec![1, 1, 0]]);
        let v = bias.to_vec3::<f32>().unwrap();
        assert_eq!(v[0][0][1], -1e9);
    }

    #[test]
    fn dec_enc_attention_bias_matches_segments() {
        let dec = Tensor::new(&[[1u32, 1, 2]], &Device::Cpu).unwrap();
        let enc = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let bias = dec_enc_attention_bias(&dec, &enc).unwrap();
        assert_eq!(bias.dims(), &[1, 3, 2]);
        assert_eq!(flags(&bias), vec![vec![0, 1], vec![0, 1], vec![1, 0]]);
    }

    #[test]
    fn segment_mask_shape_and_values() {
        let seg = Tensor::new(&[[1u32, 1, 2]], &Device::Cpu).unwrap();
        let m = segment_mask(&seg, &seg).unwrap();
        assert_eq!(m.dims(), &[1, 1, 3, 3]);
        let v = m.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(v[0][0], 0.0);
        assert_eq!(v[0][2], LARGE_NEGATIVE);
    }

    #[test]
    fn causal_and_local_paddings() {
        let c = causal_padding(3, &Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(c, vec![vec![0., 1., 1.], vec![0., 0., 1.], vec![0., 0., 0.]]);
        // left_context 2: sees itself and one previous; right_context 1: one ahead.
        let l = local_causal_padding(4, 2, 1, &Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(
            l,
            vec![
                vec![0., 0., 1., 1.],
                vec![0., 0., 0., 1.],
                vec![1., 0., 0., 0.],
                vec![1., 1., 0., 0.],
            ]
        );
    }

    #[test]
    fn unidirectional_buckets() {
        let rel = Tensor::new(&[0i64, -5, -16, -32, -128, -1000, 3], &Device::Cpu).unwrap();
        let b = relative_position_bucket(&rel, 32, 128, false).unwrap();
        assert_eq!(b.to_vec1::<u32>().unwrap(), vec![0, 5, 16, 21, 31, 31, 0]);
    }

    #[test]
    fn bidirectional_buckets() {
        let rel = Tensor::new(&[-3i64, 3, 0], &Device::Cpu).unwrap();
        let b = relative_position_bucket(&rel, 32, 128, true).unwrap();
        assert_eq!(b.to_vec1::<u32>().unwrap(), vec![3, 19, 0]);
    }
}
