//! GShard Mixture-of-Experts transformer.
//!
//! Decoder-only or encoder-decoder. Token and position embeddings come from a
//! [`SharedEmbeddingSoftmax`], which also produces the output logits, so the
//! vocabulary table is stored once:
//!
//! ```text
//! emb/{embedding, pos_emb}
//! encoder/layer_%03d/...      (optional)
//! decoder/layer_%03d/...
//! ```

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use gshard_common::{ModelConfig, PackedTensors, SubLayerKind};

use crate::builder::{DecoderState, EncoderContext, LayerBuilder, LayerStack, Segments, SharedEmbeddingSoftmax};

/// Encoder inputs, each `u32 [B, S]`.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub ids: Tensor,
    pub segment_ids: Tensor,
    pub segment_pos: Tensor,
}

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[B, L, V]`.
    pub logits: Tensor,
    /// `[B, L]`, zero at padding.
    pub per_token_loss: Tensor,
    /// `[B]`.
    pub per_example_loss: Tensor,
    /// Summed MoE load-balancing loss of every stack.
    pub aux_loss: Tensor,
    pub z_loss: Tensor,
}

/// Incremental decoding state: per-layer caches plus the encoder output.
pub struct DecodeState {
    stack: DecoderState,
    encoder: Option<(Tensor, Segments)>,
}

impl DecodeState {
    pub fn time_step(&self) -> usize {
        self.stack.time_step()
    }
}

pub struct MoeTransformer {
    softmax: SharedEmbeddingSoftmax,
    encoder: Option<LayerStack>,
    decoder: LayerStack,
    builder: LayerBuilder,
    config: ModelConfig,
}

impl MoeTransformer {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(format!("invalid model config: {e}")))?;
        let builder = LayerBuilder::new(config.builder.clone());
        let softmax = SharedEmbeddingSoftmax::new(config, builder.mesh(), vb.pp("emb"))?;
        let encoder = match &config.encoder {
            Some(stack) => Some(builder.encoder_layer_stack(
                "encoder",
                &stack.sub_layers,
                stack.num_layers,
                vb.pp("encoder"),
            )?),
            None => None,
        };
        let decoder = builder.decoder_layer_stack(
            "decoder",
            &config.decoder.sub_layers,
            config.decoder.num_layers,
            vb.pp("decoder"),
        )?;
        let stats = param_stats(config);
        tracing::info!(
            total_params = stats.total_params,
            expert_params = stats.expert_params,
            decoder_only = config.is_decoder_only(),
            "built MoE transformer"
        );
        Ok(Self {
            softmax,
            encoder,
            decoder,
            builder,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn builder(&self) -> &LayerBuilder {
        &self.builder
    }

    fn encode(&self, src: Option<&SourceBatch>, train: bool) -> Result<Option<(Tensor, Segments, Tensor)>> {
        match (&self.encoder, src) {
            (Some(encoder), Some(src)) => {
                let segments = Segments::new(src.segment_ids.clone(), src.segment_pos.clone());
                let x = self.softmax.emb_lookup(&src.ids, &src.segment_pos)?;
                let (out, aux) = encoder.forward_t(&x, &segments, None, train)?;
                Ok(Some((out, segments, aux)))
            }
            (Some(_), None) => candle_core::bail!("encoder-decoder model needs a source batch"),
            (None, Some(_)) => candle_core::bail!("decoder-only model got a source batch"),
            (None, None) => Ok(None),
        }
    }

    /// Logits and losses for a packed target batch (plus source for
    /// encoder-decoder models).
    pub fn forward_t(&self, tgt: &PackedTensors, src: Option<&SourceBatch>, train: bool) -> Result<ModelOutput> {
        let encoded = self.encode(src, train)?;
        let mut aux_loss = Tensor::new(0f32, tgt.ids.device())?;
        let context = match &encoded {
            Some((output, segments, aux)) => {
                aux_loss = (aux_loss + aux)?;
                Some(EncoderContext { output, segments })
            }
            None => None,
        };
        let segments = Segments::new(tgt.segment_ids.clone(), tgt.segment_pos.clone());
        let x = self.softmax.emb_lookup(&tgt.ids, &tgt.segment_pos)?;
        let (dec_out, dec_aux) = self.decoder.forward_t(&x, &segments, context.as_ref(), train)?;
        let aux_loss = (aux_loss + dec_aux)?;
        let loss = self.softmax.forward(&dec_out, &tgt.labels, &tgt.segment_ids)?;
        Ok(ModelOutput {
            logits: loss.logits,
            per_token_loss: loss.per_token_loss,
            per_example_loss: loss.per_example_loss,
            aux_loss,
            z_loss: loss.z_loss,
        })
    }

    /// Training objective: mean per-example loss + `aux_loss_coef · aux` + z-loss.
    pub fn objective(&self, output: &ModelOutput) -> Result<Tensor> {
        let aux = (&output.aux_loss * self.config.aux_loss_coef)?;
        (output.per_example_loss.mean_all()? + aux)? + &output.z_loss
    }

    /// Fresh decoding state; runs the encoder once for encoder-decoder models.
    pub fn init_decode_state(&self, src: Option<&SourceBatch>) -> Result<DecodeState> {
        let encoder = self
            .encode(src, false)?
            .map(|(output, segments, _)| (output, segments));
        Ok(DecodeState {
            stack: self.decoder.init_state(),
            encoder,
        })
    }

    /// Feed one token per row, `ids: u32 [B]`, and return next-token logits
    /// `[B, V]`. Every row is treated as a single segment starting at step 0.
    pub fn extend_step(&self, state: &mut DecodeState, ids: &Tensor) -> Result<Tensor> {
        let t = state.time_step();
        if t >= self.config.max_len {
            candle_core::bail!("decoding past max_len {}", self.config.max_len);
        }
        let b = ids.dim(0)?;
        let device = ids.device();
        let step = Segments::new(
            Tensor::ones((b, 1), DType::U32, device)?,
            Tensor::full(t as u32, (b, 1), device)?,
        );
        let x = self
            .softmax
            .emb_lookup(&ids.reshape((b, 1))?, &step.segment_pos)?;
        let context = state
            .encoder
            .as_ref()
            .map(|(output, segments)| EncoderContext { output, segments });
        let y = self
            .decoder
            .extend_step(&mut state.stack, &x, &step, context.as_ref())?;
        self.softmax.compute_logits(&y)?.squeeze(1)
    }
}

// ── Parameter Stats ─────────────────────────────────────────────────────────

/// Parameter counts derived from the config alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamStats {
    pub total_params: usize,
    /// Shared embedding and position table.
    pub embedding_params: usize,
    /// Everything that is not an expert weight, embeddings included.
    pub dense_params: usize,
    /// MoE `wi`/`wo` across all experts.
    pub expert_params: usize,
    /// Expert weights held by each device of the mesh.
    pub expert_params_per_device: usize,
    pub num_moe_layers: usize,
}

/// Compute parameter counts from hyper-parameters, matching the variables
/// [`MoeTransformer::new`] creates.
pub fn param_stats(config: &ModelConfig) -> ParamStats {
    let b = &config.builder;
    let m = b.model_dim;
    let attention = 4 * m * b.attention_hidden_dim();
    let sub_layer = |kind: SubLayerKind| -> (usize, usize) {
        match kind {
            _ if b.uses_relative_bias(kind) => (
                attention + b.attention_num_heads * b.relative_attention_num_buckets,
                0,
            ),
            SubLayerKind::SelfAttention
            | SubLayerKind::DecSelfAttention
            | SubLayerKind::DecSelfAttentionRelativeBias
            | SubLayerKind::DecEncAttention => (attention, 0),
            SubLayerKind::DenseReluDense => (2 * m * b.ff_dim, 0),
            SubLayerKind::DenseReluDenseGatedGelu => (3 * m * b.ff_dim, 0),
            SubLayerKind::Moe => (m * b.e_dim, 2 * b.e_dim * m * b.moe_hidden_dim),
        }
    };

    let embedding_params = (config.vocab_size + config.max_len) * m;
    let mut dense = embedding_params;
    let mut experts = 0;
    let mut num_moe_layers = 0;
    let stacks = config.encoder.iter().chain(std::iter::once(&config.decoder));
    for stack in stacks {
        dense += m; // final_layer_norm
        for &kind in &stack.sub_layers {
            let (d, e) = sub_layer(kind);
            dense += stack.num_layers * (d + m); // + ln
            experts += stack.num_layers * e;
            if kind == SubLayerKind::Moe {
                num_moe_layers += stack.num_layers;
            }
        }
    }

    ParamStats {
        total_params: dense + experts,
        embedding_params,
        dense_params: dense,
        expert_params: experts,
        expert_params_per_device: experts / b.num_devices.max(1),
        num_moe_layers,
    }
}
