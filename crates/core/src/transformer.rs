//! Batch-major transformer layers.
//!
//! | Layer | Contents |
//! |-------|----------|
//! | [`TransformerAttentionLayer`] | pre-LN → [`MultiHeadedAttention`] → residual dropout → add |
//! | [`TransformerLayer`] | self-attention, optional cross-attention, [`TransformerFeedForward`] |
//! | [`TransformerDecoderLayer`] | [`TransformerLayer`] with causal self-attention and cross-attention |
//! | [`StackedTransformerLayers`] | `num_layers` identical layers, optional final LN |
//!
//! All inputs are `[B, T, D]`; `paddings` are `[B, T]` with 1.0 at padded
//! positions.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use gshard_common::{AttentionKind, StackedTransformerConfig, TransformerLayerConfig};

use crate::attention::{AttentionState, MultiHeadedAttention};
use crate::ffn::TransformerFeedForward;
use crate::masks::causal_padding;
use crate::norm::NormLayer;
use crate::ops::Dropout;

// ── Relative attention switches ─────────────────────────────────────────────

/// Relative attention flavour to install in a layer config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeAttentionKind {
    Xl,
    Rpe,
}

/// Switch the self-attention of `config` to relative attention.
///
/// `Dot` and `LocalCausal` become their Transformer-XL versions with
/// `rel_pos_emb_dim`; `Dot` becomes RPE with clipping radius
/// `rel_pos_emb_dim`. Anything else is rejected.
pub fn use_relative_attention(
    config: &mut TransformerLayerConfig,
    rel_pos_emb_dim: usize,
    kind: RelativeAttentionKind,
) -> Result<()> {
    if rel_pos_emb_dim == 0 {
        candle_core::bail!("relative attention needs rel_pos_emb_dim > 0");
    }
    let atten = &mut config.self_atten;
    atten.kind = match (kind, &atten.kind) {
        (RelativeAttentionKind::Xl, AttentionKind::Dot) => AttentionKind::Xl {
            rel_pos_emb_dim,
            skip_term_b: false,
        },
        (
            RelativeAttentionKind::Xl,
            AttentionKind::LocalCausal {
                block_size,
                left_context,
                right_context,
            },
        ) => AttentionKind::LocalCausalXl {
            block_size: *block_size,
            left_context: *left_context,
            right_context: *right_context,
            rel_pos_emb_dim,
            skip_term_b: false,
        },
        (RelativeAttentionKind::Rpe, AttentionKind::Dot) => AttentionKind::Rpe {
            radius: rel_pos_emb_dim,
        },
        (kind, current) => {
            candle_core::bail!("cannot switch {current:?} attention to {kind:?}")
        }
    };
    Ok(())
}

/// Undo [`use_relative_attention`] for Transformer-XL attention.
pub fn clear_relative_attention(config: &mut TransformerLayerConfig) -> Result<()> {
    let atten = &mut config.self_atten;
    atten.kind = match &atten.kind {
        AttentionKind::Xl { .. } => AttentionKind::Dot,
        AttentionKind::LocalCausalXl {
            block_size,
            left_context,
            right_context,
            ..
        } => AttentionKind::LocalCausal {
            block_size: *block_size,
            left_context: *left_context,
            right_context: *right_context,
        },
        other => candle_core::bail!("{other:?} attention has no Transformer-XL term to clear"),
    };
    Ok(())
}

// ── TransformerAttentionLayer ───────────────────────────────────────────────

/// `x + dropout(attention(LN(x), source))`.
pub struct TransformerAttentionLayer {
    ln: NormLayer,
    atten: MultiHeadedAttention,
    residual_dropout: Dropout,
    is_masked: bool,
}

impl TransformerAttentionLayer {
    pub fn new(
        config: &gshard_common::AttentionConfig,
        is_masked: bool,
        residual_dropout: f64,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            ln: NormLayer::layer(config.input_dim, eps, vb.pp("ln"))?,
            atten: MultiHeadedAttention::new(config, vb.pp("atten"))?,
            residual_dropout: Dropout::new(residual_dropout),
            is_masked,
        })
    }

    pub fn attention(&self) -> &MultiHeadedAttention {
        &self.atten
    }

    /// Self-attention when `source` is `None`, otherwise attention over
    /// `source: [B, S, D]` with `paddings` describing its positions.
    ///
    /// Masked layers hide future keys; `per_step_padding_override: [B, T, S]`
    /// replaces that causal mask.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        query_vec: &Tensor,
        source: Option<&Tensor>,
        paddings: Option<&Tensor>,
        per_step_padding_override: Option<&Tensor>,
        segment_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let normed = self.ln.forward(query_vec)?;
        let source = match source {
            Some(s) => s.clone(),
            None => normed.clone(),
        };
        let local = matches!(
            self.atten.config().kind,
            AttentionKind::LocalCausal { .. } | AttentionKind::LocalCausalXl { .. }
        );
        let per_step = match per_step_padding_override {
            Some(p) => Some(p.clone()),
            // Local attention windows are causal already.
            None if self.is_masked && !local => {
                let (b, t, _) = query_vec.dims3()?;
                Some(
                    causal_padding(t, query_vec.device())?
                        .unsqueeze(0)?
                        .broadcast_as((b, t, t))?
                        .contiguous()?,
                )
            }
            None => None,
        };
        let (ctx, probs) = self.atten.forward_t(
            &normed,
            &source,
            &source,
            paddings,
            segment_mask,
            per_step.as_ref(),
            train,
        )?;
        let ctx = self.residual_dropout.forward_t(&ctx, train)?;
        Ok(((query_vec + ctx)?, probs))
    }

    /// One step of masked self-attention on `query_vec: [B, D]`.
    pub fn extend_step(
        &self,
        state: &mut AttentionState,
        query_vec: &Tensor,
        paddings: Option<&Tensor>,
    ) -> Result<Tensor> {
        if !self.is_masked {
            candle_core::bail!("extend_step needs masked self-attention");
        }
        let normed = self.ln.forward(query_vec)?;
        let ctx = self.atten.extend_step(state, &normed, paddings)?;
        query_vec + ctx
    }
}

// ── TransformerLayer ────────────────────────────────────────────────────────

pub struct TransformerLayer {
    self_atten: TransformerAttentionLayer,
    aux_atten: Option<TransformerAttentionLayer>,
    ffn: TransformerFeedForward,
}

impl TransformerLayer {
    pub fn new(config: &TransformerLayerConfig, vb: VarBuilder) -> Result<Self> {
        let self_atten = TransformerAttentionLayer::new(
            &config.self_atten,
            config.mask_self_atten,
            config.residual_dropout_prob,
            config.layer_norm_epsilon,
            vb.pp("self_atten"),
        )?;
        let aux_atten = if config.has_aux_atten {
            let mut aux = config.self_atten.clone();
            aux.kind = AttentionKind::Dot;
            aux.packed_input = false;
            Some(TransformerAttentionLayer::new(
                &aux,
                false,
                config.residual_dropout_prob,
                config.layer_norm_epsilon,
                vb.pp("aux_atten"),
            )?)
        } else {
            None
        };
        let ffn = TransformerFeedForward::new(
            config.model_dim(),
            config.ff_hidden_dim,
            config.relu_dropout_prob,
            config.residual_dropout_prob,
            config.layer_norm_epsilon,
            vb.pp("fflayer"),
        )?;
        Ok(Self {
            self_atten,
            aux_atten,
            ffn,
        })
    }

    pub fn has_aux_atten(&self) -> bool {
        self.aux_atten.is_some()
    }

    fn cross(
        &self,
        x: &Tensor,
        aux_vec: Option<&Tensor>,
        aux_paddings: Option<&Tensor>,
        aux_segment_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        match (&self.aux_atten, aux_vec) {
            (Some(layer), Some(aux)) => Ok(layer
                .forward_t(x, Some(aux), aux_paddings, None, aux_segment_mask, train)?
                .0),
            (Some(_), None) => candle_core::bail!("layer has cross-attention but no aux_vec was given"),
            (None, _) => Ok(x.clone()),
        }
    }

    /// Returns the layer output `[B, T, D]` and the self-attention probabilities.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        query_vec: &Tensor,
        paddings: Option<&Tensor>,
        aux_vec: Option<&Tensor>,
        aux_paddings: Option<&Tensor>,
        per_step_padding_override: Option<&Tensor>,
        segment_mask: Option<&Tensor>,
        aux_segment_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (x, probs) = self.self_atten.forward_t(
            query_vec,
            None,
            paddings,
            per_step_padding_override,
            segment_mask,
            train,
        )?;
        let x = self.cross(&x, aux_vec, aux_paddings, aux_segment_mask, train)?;
        Ok((self.ffn.forward_t(&x, train)?, probs))
    }

    /// One decoding step on `query_vec: [B, D]`. `paddings` covers the cached
    /// self-attention positions after this step.
    pub fn extend_step(
        &self,
        state: &mut AttentionState,
        query_vec: &Tensor,
        paddings: Option<&Tensor>,
        aux_vec: Option<&Tensor>,
        aux_paddings: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x = self.self_atten.extend_step(state, query_vec, paddings)?;
        let x = self.cross(&x.unsqueeze(1)?, aux_vec, aux_paddings, None, false)?;
        self.ffn.forward_t(&x, false)?.squeeze(1)
    }
}

/// Transformer decoder layer: causal self-attention plus cross-attention.
pub struct TransformerDecoderLayer {
    inner: TransformerLayer,
}

impl TransformerDecoderLayer {
    pub fn new(config: &TransformerLayerConfig, vb: VarBuilder) -> Result<Self> {
        let mut config = config.clone();
        config.has_aux_atten = true;
        config.mask_self_atten = true;
        Ok(Self {
            inner: TransformerLayer::new(&config, vb)?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        query_vec: &Tensor,
        paddings: Option<&Tensor>,
        aux_vec: &Tensor,
        aux_paddings: Option<&Tensor>,
        segment_mask: Option<&Tensor>,
        aux_segment_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        self.inner.forward_t(
            query_vec,
            paddings,
            Some(aux_vec),
            aux_paddings,
            None,
            segment_mask,
            aux_segment_mask,
            train,
        )
    }

    pub fn extend_step(
        &self,
        state: &mut AttentionState,
        query_vec: &Tensor,
        aux_vec: &Tensor,
        aux_paddings: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.inner
            .extend_step(state, query_vec, None, Some(aux_vec), aux_paddings)
    }
}

// ── StackedTransformerLayers ────────────────────────────────────────────────

pub struct StackedTransformerLayers {
    layers: Vec<TransformerLayer>,
    final_ln: Option<NormLayer>,
}

impl StackedTransformerLayers {
    pub fn new(config: &StackedTransformerConfig, vb: VarBuilder) -> Result<Self> {
        if config.num_layers == 0 {
            candle_core::bail!("a transformer stack needs at least one layer");
        }
        let layer_config = config.layer_config();
        let layers = (0..config.num_layers)
            .map(|i| TransformerLayer::new(&layer_config, vb.pp(format!("x_layers_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_ln = if config.final_layer_norm {
            Some(NormLayer::layer(
                config.mdl_dim,
                layer_config.layer_norm_epsilon,
                vb.pp("final_ln"),
            )?)
        } else {
            None
        };
        tracing::debug!(
            layers = config.num_layers,
            model_dim = config.mdl_dim,
            heads = config.num_atten_heads,
            "stacked transformer"
        );
        Ok(Self { layers, final_ln })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Empty per-layer caches for [`Self::extend_step`].
    pub fn init_states(&self) -> Vec<AttentionState> {
        vec![AttentionState::default(); self.layers.len()]
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward_t(
        &self,
        query_vec: &Tensor,
        paddings: Option<&Tensor>,
        aux_vec: Option<&Tensor>,
        aux_paddings: Option<&Tensor>,
        segment_mask: Option<&Tensor>,
        aux_segment_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut x = query_vec.clone();
        for layer in &self.layers {
            x = layer
                .forward_t(&x, paddings, aux_vec, aux_paddings, None, segment_mask, aux_segment_mask, train)?
                .0;
        }
        match &self.final_ln {
            Some(ln) => ln.forward(&x),
            None => Ok(x),
        }
    }

    /// One decoding step through every layer. `query_vec: [B, D]` → `[B, D]`.
    pub fn extend_step(
        &self,
        states: &mut [AttentionState],
        query_vec: &Tensor,
        aux_vec: Option<&Tensor>,
        aux_paddings: Option<&Tensor>,
    ) -> Result<Tensor> {
        if states.len() != self.layers.len() {
            candle_core::bail!("{} states for {} layers", states.len(), self.layers.len());
        }
        let mut x = query_vec.clone();
        for (layer, state) in self.layers.iter().zip(states.iter_mut()) {
            x = layer.extend_step(state, &x, None, aux_vec, aux_paddings)?;
        }
        match &self.final_ln {
            Some(ln) => ln.forward(&x),
            None => Ok(x),
        }
    }
}

/// `[B, T]` float paddings from `[B, T]` segment ids (0 = padding).
pub fn paddings_from_segment_ids(segment_id: &Tensor) -> Result<Tensor> {
    segment_id.to_dtype(DType::F32)?.eq(0f32)?.to_dtype(DType::F32)
}
