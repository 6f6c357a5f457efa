//! GShard attention sub-layers.
//!
//! Tensors follow the builder's einsum letters:
//!
//! ```text
//! q: BLHD   k, v: BMHD   logits/weights: BLHM   bias: BLM or BLHM   outputs: BLM
//! ```
//!
//! Queries are not scaled; the `(M·D)^-½` init of `wq` takes that role.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

use gshard_common::BuilderConfig;

use crate::attention::AttentionState;
use crate::masks::{dec_enc_attention_bias, dec_self_attention_bias, relative_position_bucket, self_attention_bias};
use crate::ops::{gaussian, softmax_with_extra_logit, Dropout};
use crate::sharding::Mesh;

use super::{EncoderContext, Segments};

/// Which bias an attention sub-layer builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionFlavor {
    /// Encoder self-attention: segment visibility only.
    Encoder,
    /// Causal decoder self-attention.
    DecoderSelf,
    /// Causal decoder self-attention plus a learned relative position bias.
    DecoderSelfRelative,
    /// Decoder queries over encoder outputs.
    DecoderEncoder,
}

/// Decoding state of one attention sub-layer: cached keys and values plus the
/// segment ids and positions of every cached key.
#[derive(Debug, Clone, Default)]
pub struct BuilderAttentionState {
    kv: AttentionState,
    segment_id: Option<Tensor>,
    segment_pos: Option<Tensor>,
}

impl BuilderAttentionState {
    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    fn append(&mut self, k: Tensor, v: Tensor, step: &Segments) -> Result<()> {
        self.kv.append(k, v)?;
        self.segment_id = Some(append_time(self.segment_id.take(), &step.segment_id)?);
        self.segment_pos = Some(append_time(self.segment_pos.take(), &step.segment_pos)?);
        Ok(())
    }
}

fn append_time(cache: Option<Tensor>, step: &Tensor) -> Result<Tensor> {
    match cache {
        Some(c) => Tensor::cat(&[&c, step], 1),
        None => Ok(step.clone()),
    }
}

pub struct BuilderAttention {
    flavor: AttentionFlavor,
    wq: Tensor,
    wk: Tensor,
    wv: Tensor,
    wo: Tensor,
    /// `[H, num_buckets]`
    relative_bias: Option<Tensor>,
    config: BuilderConfig,
    mesh: Mesh,
    scope: String,
    dropout: Dropout,
}

impl BuilderAttention {
    pub fn new(
        config: &BuilderConfig,
        mesh: &Mesh,
        scope: &str,
        flavor: AttentionFlavor,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (m, h, d) = (
            config.model_dim,
            config.attention_num_heads,
            config.attention_key_value_dim,
        );
        let hd: Vec<usize> = if config.attention_combine_dims {
            vec![h * d]
        } else {
            vec![h, d]
        };
        let with_model_first = [&[m][..], &hd].concat();
        let with_model_last = [&hd[..], &[m]].concat();
        let w = vb.pp("w");
        let wq = w.get_with_hints(with_model_first.clone(), "wq", gaussian(((m * d) as f64).powf(-0.5)))?;
        let wk = w.get_with_hints(with_model_first.clone(), "wk", gaussian((m as f64).powf(-0.5)))?;
        let wv = w.get_with_hints(with_model_first, "wv", gaussian((m as f64).powf(-0.5)))?;
        let wo = w.get_with_hints(with_model_last, "wo", gaussian(((h * d) as f64).powf(-0.5)))?;
        let relative_bias = if flavor == AttentionFlavor::DecoderSelfRelative {
            let nb = config.relative_attention_num_buckets;
            let stdev = ((h * nb) as f64).powf(-0.5);
            Some(vb.pp("wrb").get_with_hints((h, nb), "wrb", gaussian(stdev))?)
        } else {
            None
        };
        Ok(Self {
            flavor,
            wq,
            wk,
            wv,
            wo,
            relative_bias,
            config: config.clone(),
            mesh: mesh.clone(),
            scope: scope.to_string(),
            dropout: Dropout::from_builder(config.dropout_rate, config),
        })
    }

    pub fn flavor(&self) -> AttentionFlavor {
        self.flavor
    }

    fn heads(&self) -> (usize, usize) {
        (self.config.attention_num_heads, self.config.attention_key_value_dim)
    }

    /// `BLM,MHD->BLHD`
    fn project(&self, x: &Tensor, w: &Tensor) -> Result<Tensor> {
        let (b, l, m) = x.dims3()?;
        let (h, d) = self.heads();
        x.reshape((b * l, m))?
            .matmul(&w.reshape((m, h * d))?)?
            .reshape((b, l, h, d))
    }

    /// `HDM,BLHD->BLM`
    fn output(&self, o: &Tensor) -> Result<Tensor> {
        let (b, l, h, d) = o.dims4()?;
        let m = self.config.model_dim;
        o.reshape((b * l, h * d))?
            .matmul(&self.wo.reshape((h * d, m))?)?
            .reshape((b, l, m))
    }

    /// Attention core over `q: BLHD`, `k, v: BMHD` with `bias: BLM | BLHM`.
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let q = self.mesh.split(&format!("{}/attention/_q", self.scope), q)?;
        let k = self.mesh.split(&format!("{}/attention/_k", self.scope), k)?;
        let v = self.mesh.split(&format!("{}/attention/_v", self.scope), v)?;
        // Head-major for batched matmul: BHLD · BHDM -> BHLM.
        let qh = q.permute((0, 2, 1, 3))?.contiguous()?;
        let kh = k.permute((0, 2, 3, 1))?.contiguous()?;
        let logits = qh.matmul(&kh)?;
        let bias = match bias.rank() {
            3 => bias.unsqueeze(1)?,
            4 => bias.permute((0, 2, 1, 3))?,
            r => candle_core::bail!("attention bias must be BLM or BLHM, got rank {r}"),
        };
        let logits = logits.broadcast_add(&bias.to_dtype(logits.dtype())?)?;
        let weights = softmax_with_extra_logit(&logits, self.config.attention_extra_logit)?;
        let weights = self.dropout.forward_t(&weights, train)?;
        let vh = v.permute((0, 2, 1, 3))?.contiguous()?;
        weights.matmul(&vh)?.permute((0, 2, 1, 3))
    }

    /// Add the per-head relative bias: `BLM` → `BLHM`.
    fn add_relative_bias(&self, bias: &Tensor, query_pos: &Tensor, key_pos: &Tensor) -> Result<Tensor> {
        let Some(weights) = &self.relative_bias else {
            return Ok(bias.clone());
        };
        let (l, m) = (query_pos.dim(1)?, key_pos.dim(1)?);
        let (query_pos, key_pos) = if self.config.relative_attention_use_universal_1d_position {
            // Keys cover 0..M; queries are the last L of them.
            let device = bias.device();
            (arange_row(m - l, m, device)?, arange_row(0, m, device)?)
        } else {
            (query_pos.to_dtype(DType::I64)?, key_pos.to_dtype(DType::I64)?)
        };
        // Negative when the query is after the key.
        let relative = key_pos.unsqueeze(1)?.broadcast_sub(&query_pos.unsqueeze(2)?)?;
        let bucket = relative_position_bucket(
            &relative,
            self.config.relative_attention_num_buckets,
            self.config.relative_attention_max_distance,
            false,
        )?;
        let (bb, _, _) = bucket.dims3()?;
        let h = weights.dim(0)?;
        let increment = weights
            .t()?
            .contiguous()?
            .index_select(&bucket.flatten_all()?, 0)?
            .reshape((bb, l, m, h))?
            .permute((0, 1, 3, 2))?;
        bias.unsqueeze(2)?.broadcast_add(&increment)
    }

    /// `x: [B, L, M]` → `(outputs [B, L, M], aux_loss = 0)`.
    pub fn forward_t(
        &self,
        x: &Tensor,
        segments: &Segments,
        encoder: Option<&EncoderContext>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let q = self.project(x, &self.wq)?;
        let (kv_input, bias) = match self.flavor {
            AttentionFlavor::Encoder => (x.clone(), self_attention_bias(&segments.segment_id)?),
            AttentionFlavor::DecoderSelf | AttentionFlavor::DecoderSelfRelative => {
                let bias = dec_self_attention_bias(
                    &segments.segment_id,
                    &segments.segment_pos,
                    &segments.segment_id,
                    &segments.segment_pos,
                )?;
                let bias = self.add_relative_bias(&bias, &segments.segment_pos, &segments.segment_pos)?;
                (x.clone(), bias)
            }
            AttentionFlavor::DecoderEncoder => {
                let enc = self.require_encoder(encoder)?;
                let bias = dec_enc_attention_bias(&segments.segment_id, &enc.segments.segment_id)?;
                (enc.output.clone(), bias)
            }
        };
        let k = self.project(&kv_input, &self.wk)?;
        let v = self.project(&kv_input, &self.wv)?;
        let o = self.attend(&q, &k, &v, &bias, train)?;
        let outputs = self.output(&o)?;
        Ok((outputs, Tensor::new(0f32, x.device())?))
    }

    /// One decoding step. `x: [B, 1, M]`, `step` holds that position's
    /// segment id and position.
    pub fn extend_step(
        &self,
        state: &mut BuilderAttentionState,
        x: &Tensor,
        step: &Segments,
        encoder: Option<&EncoderContext>,
    ) -> Result<Tensor> {
        let q = self.project(x, &self.wq)?;
        let (k, v, bias) = match self.flavor {
            AttentionFlavor::Encoder => {
                candle_core::bail!("{}: encoder self-attention has no decoding step", self.scope)
            }
            AttentionFlavor::DecoderSelf | AttentionFlavor::DecoderSelfRelative => {
                state.append(self.project(x, &self.wk)?, self.project(x, &self.wv)?, step)?;
                let (Some(k), Some(v), Some(ids), Some(pos)) = (
                    state.kv.key(),
                    state.kv.value(),
                    state.segment_id.as_ref(),
                    state.segment_pos.as_ref(),
                ) else {
                    candle_core::bail!("{}: decoding state is empty after append", self.scope)
                };
                let bias = dec_self_attention_bias(&step.segment_id, &step.segment_pos, ids, pos)?;
                let bias = self.add_relative_bias(&bias, &step.segment_pos, pos)?;
                (k.clone(), v.clone(), bias)
            }
            AttentionFlavor::DecoderEncoder => {
                let enc = self.require_encoder(encoder)?;
                let bias = dec_enc_attention_bias(&step.segment_id, &enc.segments.segment_id)?;
                (
                    self.project(enc.output, &self.wk)?,
                    self.project(enc.output, &self.wv)?,
                    bias,
                )
            }
        };
        let o = self.attend(&q, &k, &v, &bias, false)?;
        self.output(&o)
    }

    fn require_encoder<'a>(&self, encoder: Option<&'a EncoderContext<'a>>) -> Result<&'a EncoderContext<'a>> {
        match encoder {
            Some(enc) => Ok(enc),
            None => candle_core::bail!("{}: dec-enc attention needs encoder outputs", self.scope),
        }
    }
}

/// `[1, hi - lo]` row of positions.
fn arange_row(lo: usize, hi: usize, device: &Device) -> Result<Tensor> {
    Tensor::arange(lo as i64, hi as i64, device)?.unsqueeze(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    fn config() -> BuilderConfig {
        BuilderConfig {
            model_dim: 8,
            attention_num_heads: 2,
            attention_key_value_dim: 3,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            ..Default::default()
        }
    }

    fn segments(ids: &[u32], pos: &[u32]) -> Segments {
        Segments {
            segment_id: Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap(),
            segment_pos: Tensor::new(pos, &Device::Cpu).unwrap().unsqueeze(0).unwrap(),
        }
    }

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
    fn weight_shapes_and_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = config();
        BuilderAttention::new(&cfg, &Mesh::new(1), "att", AttentionFlavor::DecoderSelfRelative, vb.pp("att")).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["att.w.wq"].as_tensor().dims(), &[8, 2, 3]);
        assert_eq!(data["att.w.wo"].as_tensor().dims(), &[2, 3, 8]);
        assert_eq!(data["att.wrb.wrb"].as_tensor().dims(), &[2, 8]);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let combined = BuilderConfig {
            attention_combine_dims: true,
            ..config()
        };
        BuilderAttention::new(&combined, &Mesh::new(1), "att", AttentionFlavor::Encoder, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["w.wk"].as_tensor().dims(), &[8, 6]);
        assert_eq!(data["w.wo"].as_tensor().dims(), &[6, 8]);
    }

    #[test]
    fn encoder_attention_is_segment_local() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let att = BuilderAttention::new(&config(), &Mesh::new(1), "att", AttentionFlavor::Encoder, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 4, 8), &Device::Cpu).unwrap();
        let seg = segments(&[1, 1, 2, 2], &[0, 1, 0, 1]);
        let (y, aux) = att.forward_t(&x, &seg, None, false).unwrap();
        assert_eq!(aux.to_scalar::<f32>().unwrap(), 0.0);
        // Changing segment 2 must not affect segment 1.
        let x2 = x
            .slice_assign(&[0..1, 2..4, 0..8], &Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let (y2, _) = att.forward_t(&x2, &seg, None, false).unwrap();
        assert!(max_diff(&y.i((.., 0..2)).unwrap(), &y2.i((.., 0..2)).unwrap()) < 1e-6);
    }

    fn check_decoding(flavor: AttentionFlavor, universal_1d: bool) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = BuilderConfig {
            relative_attention_use_universal_1d_position: universal_1d,
            ..config()
        };
        let att = BuilderAttention::new(&cfg, &Mesh::new(1), "att", flavor, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 5, 8), &Device::Cpu).unwrap();
        let seg = segments(&[1, 1, 1, 1, 1], &[0, 1, 2, 3, 4]);
        let (full, _) = att.forward_t(&x, &seg, None, false).unwrap();
        let mut state = BuilderAttentionState::default();
        for t in 0..5 {
            let step = Segments {
                segment_id: seg.segment_id.i((.., t..t + 1)).unwrap(),
                segment_pos: seg.segment_pos.i((.., t..t + 1)).unwrap(),
            };
            let y = att.extend_step(&mut state, &x.i((.., t..t + 1)).unwrap(), &step, None).unwrap();
            assert!(max_diff(&y, &full.i((.., t..t + 1)).unwrap()) < 1e-4, "{flavor:?} step {t}");
        }
        assert_eq!(state.len(), 5);
    }

    #[test]
    fn decoding_matches_full_pass() {
        check_decoding(AttentionFlavor::DecoderSelf, false);
        check_decoding(AttentionFlavor::DecoderSelfRelative, false);
        check_decoding(AttentionFlavor::DecoderSelfRelative, true);
    }

    #[test]
    fn relative_bias_uses_buckets() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let att = BuilderAttention::new(&config(), &Mesh::new(1), "att", AttentionFlavor::DecoderSelfRelative, vb)
            .unwrap();
        let pos = Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap();
        let zero = Tensor::zeros((1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let bias = att.add_relative_bias(&zero, &pos, &pos).unwrap();
        assert_eq!(bias.dims(), &[1, 3, 2, 3]);
        let wrb = att.relative_bias.as_ref().unwrap().to_vec2::<f32>().unwrap();
        let b = bias.squeeze(0).unwrap().to_vec3::<f32>().unwrap();
        // query 2, key 0: distance 2 -> bucket 2; key after query -> bucket 0.
        assert_eq!(b[2][1][0], wrb[1][2]);
        assert_eq!(b[0][0][2], wrb[0][0]);
    }

    #[test]
    fn dec_enc_requires_encoder() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let att = BuilderAttention::new(&config(), &Mesh::new(1), "att", AttentionFlavor::DecoderEncoder, vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 2, 8), &Device::Cpu).unwrap();
        let seg = segments(&[1, 1], &[0, 1]);
        assert!(att.forward_t(&x, &seg, None, false).is_err());
        let enc_out = Tensor::randn(0f32, 1f32, (1, 3, 8), &Device::Cpu).unwrap();
        let enc_seg = segments(&[1, 1, 0], &[0, 1, 0]);
        let ctx = EncoderContext {
            output: &enc_out,
            segments: &enc_seg,
        };
        let (y, _) = att.forward_t(&x, &seg, Some(&ctx), false).unwrap();
        assert_eq!(y.dims(), &[1, 2, 8]);
    }
}
