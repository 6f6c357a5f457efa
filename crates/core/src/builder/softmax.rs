//! Token embeddings and softmax cross-entropy heads of the builder.
//!
//! | Layer | Variables | Loss |
//! |-------|-----------|------|
//! | [`Embedding`] | `w/embedding [V, M]` | — |
//! | [`SmoothedSoftmax`] | `w/embedding [V, M]` | label-smoothed xent / `L` |
//! | [`SharedEmbeddingSoftmax`] | `embedding [V, M]`, `pos_emb [max_len, M]` | smoothed xent + z-loss |

use candle_core::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use gshard_common::{BuilderConfig, ModelConfig};

use crate::ops::{gaussian, logsumexp, one_hot};
use crate::sharding::Mesh;

/// Row lookup `ids [B, L]` into `table [V, M]`.
fn lookup(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let (b, l) = ids.dims2()?;
    let m = table.dim(1)?;
    table
        .index_select(&ids.flatten_all()?.to_dtype(DType::U32)?, 0)?
        .reshape((b, l, m))
}

/// Cross-entropy against smoothed one-hot targets, `[B, L, V]` → `[B, L]`.
fn smoothed_xent(logits: &Tensor, labels: &Tensor, label_smoothing: f64) -> Result<Tensor> {
    let vocab = logits.dim(D::Minus1)?;
    let off = label_smoothing / vocab as f64;
    let on = 1.0 - label_smoothing + off;
    let targets = one_hot(labels, vocab, DType::F32)?.affine(on - off, off)?;
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    (targets * log_probs)?.sum(D::Minus1)?.neg()
}

fn non_padding(segment_id: &Tensor) -> Result<Tensor> {
    segment_id
        .to_dtype(DType::F32)?
        .ne(0f32)?
        .to_dtype(DType::F32)
}

/// Everything a softmax head computes for one batch.
#[derive(Debug, Clone)]
pub struct SoftmaxLoss {
    /// `[B, L, V]`.
    pub logits: Tensor,
    /// `[B, L]`, zero at padding.
    pub per_token_loss: Tensor,
    /// `[B]`.
    pub per_example_loss: Tensor,
    /// Scalar; zero for heads without a z-loss.
    pub z_loss: Tensor,
}

// ── Embedding ───────────────────────────────────────────────────────────────

pub struct Embedding {
    weight: Tensor,
    mesh: Mesh,
}

impl Embedding {
    pub fn new(vocab_size: usize, config: &BuilderConfig, mesh: &Mesh, vb: VarBuilder) -> Result<Self> {
        let weight = vb
            .pp("w")
            .get_with_hints((vocab_size, config.model_dim), "embedding", gaussian(1.0))?;
        Ok(Self {
            weight,
            mesh: mesh.clone(),
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// `ids [B, L]` → `[B, L, M]`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let ids = self.mesh.split("embedding/ids_split", ids)?;
        lookup(&self.weight, &ids)
    }
}

// ── SmoothedSoftmax ─────────────────────────────────────────────────────────

/// Label-smoothed softmax over its own `[V, M]` weight. The per-example loss
/// is divided by the label length, padding included.
pub struct SmoothedSoftmax {
    weight: Tensor,
    model_dim: usize,
    label_smoothing: f64,
    mesh: Mesh,
}

impl SmoothedSoftmax {
    pub fn new(vocab_size: usize, config: &BuilderConfig, mesh: &Mesh, vb: VarBuilder) -> Result<Self> {
        let weight = vb
            .pp("w")
            .get_with_hints((vocab_size, config.model_dim), "embedding", gaussian(1.0))?;
        Ok(Self {
            weight,
            model_dim: config.model_dim,
            label_smoothing: config.label_smoothing,
            mesh: mesh.clone(),
        })
    }

    /// `dec_outs [B, L, M]`, `labels` and `segment_id` `[B, L]`.
    pub fn forward(&self, dec_outs: &Tensor, labels: &Tensor, segment_id: &Tensor) -> Result<SoftmaxLoss> {
        let x = self.mesh.split("softmax/dec_outs", &(dec_outs * (self.model_dim as f64).powf(-0.5))?)?;
        let logits = self.mesh.split("softmax/logits", &x.broadcast_matmul(&self.weight.t()?)?)?;
        let non_padding = non_padding(segment_id)?;
        let per_token_loss = (smoothed_xent(&logits, labels, self.label_smoothing)? * &non_padding)?;
        let len = per_token_loss.dim(1)? as f64;
        let per_example_loss = (per_token_loss.sum(1)? / len)?;
        Ok(SoftmaxLoss {
            logits,
            per_token_loss,
            per_example_loss,
            z_loss: Tensor::new(0f32, dec_outs.device())?,
        })
    }
}

// ── SharedEmbeddingSoftmax ──────────────────────────────────────────────────

/// Input embedding and output softmax sharing one `[V, M]` table.
///
/// Embedding: `emb[ids] · √M + pos_emb[pos]`.
/// Logits: `(x · M^-½) · embᵀ`, optionally clipped to `±logits_abs_max`.
/// z-loss: `coef · Σ(logsumexp² · non_padding) / max(Σ non_padding, 1)`.
pub struct SharedEmbeddingSoftmax {
    embedding: Tensor,
    pos_emb: Tensor,
    model_dim: usize,
    max_len: usize,
    label_smoothing: f64,
    logits_abs_max: Option<f64>,
    z_loss_coef: f64,
    use_tgt_labels_size_as_loss_denominator: bool,
    mesh: Mesh,
}

impl SharedEmbeddingSoftmax {
    pub fn new(config: &ModelConfig, mesh: &Mesh, vb: VarBuilder) -> Result<Self> {
        let m = config.builder.model_dim;
        let embedding = vb.get_with_hints(
            (config.vocab_size, m),
            "embedding",
            gaussian((m as f64).powf(-0.5)),
        )?;
        let pos_emb = vb.get_with_hints(
            (config.max_len, m),
            "pos_emb",
            gaussian((m as f64).powf(-0.5)),
        )?;
        Ok(Self {
            embedding,
            pos_emb,
            model_dim: m,
            max_len: config.max_len,
            label_smoothing: config.builder.label_smoothing,
            logits_abs_max: config.logits_abs_max,
            z_loss_coef: config.z_loss_coef,
            use_tgt_labels_size_as_loss_denominator: config.use_tgt_labels_size_as_loss_denominator,
            mesh: mesh.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.dims()[0]
    }

    /// `ids, segment_pos [B, L]` → `[B, L, M]`.
    pub fn emb_lookup(&self, ids: &Tensor, segment_pos: &Tensor) -> Result<Tensor> {
        let ids = self.mesh.split("shared_emb/ids_split", ids)?;
        let pos = segment_pos.to_dtype(DType::U32)?;
        let max_pos = pos.flatten_all()?.max(0)?.to_scalar::<u32>()? as usize;
        if max_pos >= self.max_len {
            candle_core::bail!("segment position {max_pos} exceeds max_len {}", self.max_len);
        }
        let tokens = (lookup(&self.embedding, &ids)? * (self.model_dim as f64).sqrt())?;
        tokens + lookup(&self.pos_emb, &pos)?
    }

    /// `x [B, L, M]` → logits `[B, L, V]`.
    pub fn compute_logits(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x * (self.model_dim as f64).powf(-0.5))?;
        let logits = x.broadcast_matmul(&self.embedding.t()?)?;
        let logits = match self.logits_abs_max {
            Some(max) => logits.clamp(-max, max)?,
            None => logits,
        };
        self.mesh.split("shared_emb/logits_split", &logits)
    }

    /// Logits plus smoothed cross-entropy and z-loss.
    pub fn forward(&self, x: &Tensor, labels: &Tensor, segment_id: &Tensor) -> Result<SoftmaxLoss> {
        let logits = self.compute_logits(x)?;
        let non_padding = non_padding(segment_id)?;
        let per_token_loss = (smoothed_xent(&logits, labels, self.label_smoothing)? * &non_padding)?;

        let lse = logsumexp(&logits.to_dtype(DType::F32)?)?.squeeze(D::Minus1)?;
        let count = non_padding.sum_all()?.to_scalar::<f32>()?.max(1.0) as f64;
        let z_loss = ((lse.sqr()? * &non_padding)?.sum_all()? * (self.z_loss_coef / count))?;

        let denominator = if self.use_tgt_labels_size_as_loss_denominator {
            non_padding.ones_like()?.sum(1)?
        } else {
            non_padding.sum(1)?.clamp(1f32, f32::MAX)?
        };
        let per_example_loss = per_token_loss.sum(1)?.div(&denominator)?;
        tracing::trace!(z_loss_coef = self.z_loss_coef, tokens = count, "shared softmax loss");
        Ok(SoftmaxLoss {
            logits,
            per_token_loss,
            per_example_loss,
            z_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn builder_config() -> BuilderConfig {
        BuilderConfig {
            model_dim: 4,
            label_smoothing: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn embedding_selects_rows() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mesh = Mesh::new(1);
        let emb = Embedding::new(5, &builder_config(), &mesh, vb.pp("emb")).unwrap();
        let ids = Tensor::new(&[[3u32, 0], [4, 3]], &Device::Cpu).unwrap();
        let out = emb.forward(&ids).unwrap();
        assert_eq!(out.dims(), &[2, 2, 4]);
        let w = emb.weight().to_vec2::<f32>().unwrap();
        let out = out.to_vec3::<f32>().unwrap();
        assert_eq!(out[0][0], w[3]);
        assert_eq!(out[1][0], w[4]);
        assert_eq!(out[1][1], w[3]);
        assert!(mesh.log().get("embedding/ids_split").is_some());
        assert!(varmap.data().lock().unwrap().contains_key("emb.w.embedding"));
    }

    #[test]
    fn smoothed_softmax_matches_manual_xent() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = builder_config();
        let softmax = SmoothedSoftmax::new(3, &cfg, &Mesh::new(1), vb).unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 2, 4), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[2u32, 0]], &Device::Cpu).unwrap();
        let seg = Tensor::new(&[[1u32, 0]], &Device::Cpu).unwrap();
        let out = softmax.forward(&x, &labels, &seg).unwrap();

        let logits = out.logits.to_vec3::<f32>().unwrap();
        let row = &logits[0][0];
        let max = row.iter().cloned().fold(f32::MIN, f32::max);
        let lse = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
        let (off, on) = (0.1f32 / 3.0, 0.9f32 + 0.1 / 3.0);
        let expected: f32 = row
            .iter()
            .enumerate()
            .map(|(v, l)| -(if v == 2 { on } else { off }) * (l - lse))
            .sum();
        let per_token = out.per_token_loss.to_vec2::<f32>().unwrap();
        assert!((per_token[0][0] - expected).abs() < 1e-5);
        assert_eq!(per_token[0][1], 0.0);
        // Denominator is the label length (2), not the real-token count.
        let per_example = out.per_example_loss.to_vec1::<f32>().unwrap();
        assert!((per_example[0] - expected / 2.0).abs() < 1e-5);
    }

    fn model_config(denominator_is_length: bool) -> ModelConfig {
        ModelConfig {
            vocab_size: 6,
            max_len: 8,
            builder: builder_config(),
            logits_abs_max: Some(0.5),
            z_loss_coef: 1e-2,
            use_tgt_labels_size_as_loss_denominator: denominator_is_length,
            ..Default::default()
        }
    }

    #[test]
    fn shared_embedding_scales_and_adds_positions() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let softmax = SharedEmbeddingSoftmax::new(&model_config(true), &Mesh::new(1), vb).unwrap();
        let ids = Tensor::new(&[[5u32, 1]], &Device::Cpu).unwrap();
        let pos = Tensor::new(&[[0u32, 7]], &Device::Cpu).unwrap();
        let out = softmax.emb_lookup(&ids, &pos).unwrap().to_vec3::<f32>().unwrap();
        let emb = softmax.embedding.to_vec2::<f32>().unwrap();
        let pos_emb = softmax.pos_emb.to_vec2::<f32>().unwrap();
        for d in 0..4 {
            assert!((out[0][1][d] - (emb[1][d] * 2.0 + pos_emb[7][d])).abs() < 1e-5);
        }
        let too_far = Tensor::new(&[[0u32, 8]], &Device::Cpu).unwrap();
        assert!(softmax.emb_lookup(&ids, &too_far).is_err());
    }

    #[test]
    fn shared_softmax_clips_logits_and_adds_z_loss() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let softmax = SharedEmbeddingSoftmax::new(&model_config(false), &Mesh::new(1), vb).unwrap();
        let x = (Tensor::randn(0f32, 1f32, (1, 3, 4), &Device::Cpu).unwrap() * 50.0).unwrap();
        let labels = Tensor::new(&[[1u32, 2, 0]], &Device::Cpu).unwrap();
        let seg = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();
        let out = softmax.forward(&x, &labels, &seg).unwrap();
        let logits = out.logits.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(logits.iter().all(|v| v.abs() <= 0.5 + 1e-6));

        // z-loss over the two real tokens.
        let rows = out.logits.to_vec3::<f32>().unwrap();
        let mut z = 0f32;
        for row in &rows[0][..2] {
            let lse = row.iter().map(|v| v.exp()).sum::<f32>().ln();
            z += lse * lse;
        }
        let got = out.z_loss.to_scalar::<f32>().unwrap();
        assert!((got - 1e-2 * z / 2.0).abs() < 1e-5);

        // Denominator is the real-token count.
        let per_token = out.per_token_loss.to_vec2::<f32>().unwrap();
        let per_example = out.per_example_loss.to_vec1::<f32>().unwrap();
        assert!((per_example[0] - (per_token[0][0] + per_token[0][1]) / 2.0).abs() < 1e-5);
    }
}
