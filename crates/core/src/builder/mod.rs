//! GShard layer builder.
//!
//! A [`LayerBuilder`] turns a [`BuilderConfig`] and a device [`Mesh`] into
//! encoder/decoder stacks. Every sub-layer has the same interface:
//!
//! ```text
//! (x, segment_id, segment_pos, [encoder_output, encoder_segment_id, encoder_segment_pos])
//!     -> (outputs, aux_loss)
//! ```
//!
//! Variables are laid out the way the stacks are named:
//!
//! ```text
//! decoder/
//!   layer_000/
//!     ln/w/scale
//!     dec_self_attention/w/{wq,wk,wv,wo}
//!   layer_001/
//!     ln/w/scale
//!     moe/{wi,wo,top_2_gating/w}
//!   ...
//!   final_layer_norm/w/scale
//! ```

mod attention;
mod softmax;

pub use attention::{AttentionFlavor, BuilderAttention, BuilderAttentionState};
pub use softmax::{Embedding, SharedEmbeddingSoftmax, SmoothedSoftmax, SoftmaxLoss};

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use gshard_common::{BuilderConfig, SubLayerKind};

use crate::ffn::DenseReluDense;
use crate::moe::MoeLayer;
use crate::norm::NormLayer;
use crate::ops::{mask_padding, Dropout};
use crate::sharding::Mesh;

/// Packed-row metadata: `segment_id` (0 = padding) and `segment_pos`, `[B, L]`.
#[derive(Debug, Clone)]
pub struct Segments {
    pub segment_id: Tensor,
    pub segment_pos: Tensor,
}

impl Segments {
    pub fn new(segment_id: Tensor, segment_pos: Tensor) -> Self {
        Self {
            segment_id,
            segment_pos,
        }
    }

    /// Column `t` as a `[B, 1]` step.
    pub fn step(&self, t: usize) -> Result<Self> {
        Ok(Self {
            segment_id: self.segment_id.narrow(1, t, 1)?,
            segment_pos: self.segment_pos.narrow(1, t, 1)?,
        })
    }
}

/// Encoder outputs a decoder attends to.
#[derive(Debug, Clone, Copy)]
pub struct EncoderContext<'a> {
    pub output: &'a Tensor,
    pub segments: &'a Segments,
}

// ── Sub-layers ──────────────────────────────────────────────────────────────

pub enum SubLayer {
    Attention(BuilderAttention),
    Dense {
        ffn: DenseReluDense,
        mesh: Mesh,
        scope: String,
    },
    Moe(MoeLayer),
}

impl SubLayer {
    pub fn forward_t(
        &self,
        x: &Tensor,
        segments: &Segments,
        encoder: Option<&EncoderContext>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Attention(att) => att.forward_t(x, segments, encoder, train),
            Self::Dense { ffn, mesh, scope } => {
                let y = mesh.split(&format!("{scope}/outputs_split"), &ffn.forward_t(x, train)?)?;
                Ok((y, Tensor::new(0f32, x.device())?))
            }
            Self::Moe(moe) => moe.forward_t(x, &segments.segment_id, train),
        }
    }

    /// One decoding step on `x: [B, 1, M]`.
    pub fn extend_step(
        &self,
        state: &mut BuilderAttentionState,
        x: &Tensor,
        step: &Segments,
        encoder: Option<&EncoderContext>,
    ) -> Result<Tensor> {
        match self {
            Self::Attention(att) => att.extend_step(state, x, step, encoder),
            Self::Dense { ffn, .. } => ffn.forward_t(x, false),
            Self::Moe(moe) => Ok(moe.forward_groups(x, &step.segment_id, 1, false)?.0),
        }
    }
}

/// `x + dropout(layer(LN(x)))` with `x` masked by the segment ids first.
pub struct ResidualLayer {
    ln: NormLayer,
    layer: SubLayer,
    dropout: Dropout,
}

impl ResidualLayer {
    pub fn sub_layer(&self) -> &SubLayer {
        &self.layer
    }

    pub fn forward_t(
        &self,
        x: &Tensor,
        segments: &Segments,
        encoder: Option<&EncoderContext>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let masked = mask_padding(x, &segments.segment_id)?;
        let (y, aux_loss) = self
            .layer
            .forward_t(&self.ln.forward(&masked)?, segments, encoder, train)?;
        let y = self.dropout.forward_t(&y, train)?;
        Ok(((masked + y)?, aux_loss))
    }

    pub fn extend_step(
        &self,
        state: &mut BuilderAttentionState,
        x: &Tensor,
        step: &Segments,
        encoder: Option<&EncoderContext>,
    ) -> Result<Tensor> {
        let masked = mask_padding(x, &step.segment_id)?;
        let y = self
            .layer
            .extend_step(state, &self.ln.forward(&masked)?, step, encoder)?;
        masked + y
    }
}

// ── Stacks ──────────────────────────────────────────────────────────────────

/// Per-layer decoding states of a decoder stack.
#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    layers: Vec<BuilderAttentionState>,
}

impl DecoderState {
    /// Positions decoded so far.
    pub fn time_step(&self) -> usize {
        self.layers.iter().map(|s| s.len()).max().unwrap_or(0)
    }
}

/// `num` repetitions of a list of sub-layers, each wrapped in a
/// [`ResidualLayer`] named `layer_%03d`, then a final layer norm.
pub struct LayerStack {
    name: String,
    mesh: Mesh,
    layers: Vec<ResidualLayer>,
    final_layer_norm: NormLayer,
    input_dropout: Dropout,
    output_dropout: Dropout,
    decoder: bool,
}

impl LayerStack {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layers(&self) -> &[ResidualLayer] {
        &self.layers
    }

    pub fn is_decoder(&self) -> bool {
        self.decoder
    }

    fn split(&self, suffix: &str, x: &Tensor) -> Result<Tensor> {
        self.mesh.split(&format!("{}/{suffix}", self.name), x)
    }

    /// `x: [B, L, M]` → `(outputs [B, L, M], summed aux loss)`.
    pub fn forward_t(
        &self,
        x: &Tensor,
        segments: &Segments,
        encoder: Option<&EncoderContext>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let x = self.split("inputs_split", x)?;
        let segments = Segments {
            segment_id: self.split("segment_id_split", &segments.segment_id)?,
            segment_pos: self.split("segment_pos_split", &segments.segment_pos)?,
        };
        let encoder_split = match encoder {
            Some(enc) if self.decoder => Some((
                self.split("encoder_output_split", enc.output)?,
                Segments {
                    segment_id: self.split("encoder_segment_id_split", &enc.segments.segment_id)?,
                    segment_pos: self.split("encoder_segment_pos_split", &enc.segments.segment_pos)?,
                },
            )),
            _ => None,
        };
        let encoder = encoder_split.as_ref().map(|(output, segments)| EncoderContext { output, segments });

        let mut x = self.input_dropout.forward_t(&x, train)?;
        let mut loss = Tensor::new(0f32, x.device())?;
        for layer in &self.layers {
            let (y, aux_loss) = layer.forward_t(&x, &segments, encoder.as_ref(), train)?;
            x = y;
            loss = (loss + aux_loss.to_dtype(DType::F32)?)?;
        }
        let y = self.final_layer_norm.forward(&x)?;
        let y = self.output_dropout.forward_t(&y, train)?;
        Ok((mask_padding(&y, &segments.segment_id)?, loss))
    }

    /// Fresh decoding state with one slot per layer.
    pub fn init_state(&self) -> DecoderState {
        DecoderState {
            layers: vec![BuilderAttentionState::default(); self.layers.len()],
        }
    }

    /// Decode one position: `x: [B, 1, M]` → `[B, 1, M]`.
    pub fn extend_step(
        &self,
        state: &mut DecoderState,
        x: &Tensor,
        step: &Segments,
        encoder: Option<&EncoderContext>,
    ) -> Result<Tensor> {
        if !self.decoder {
            candle_core::bail!("{}: only decoder stacks can be extended", self.name);
        }
        if state.layers.len() != self.layers.len() {
            candle_core::bail!(
                "{}: state has {} layers, stack has {}",
                self.name,
                state.layers.len(),
                self.layers.len()
            );
        }
        let mut x = x.clone();
        for (layer, layer_state) in self.layers.iter().zip(state.layers.iter_mut()) {
            x = layer.extend_step(layer_state, &x, step, encoder)?;
        }
        let y = self.final_layer_norm.forward(&x)?;
        mask_padding(&y, &step.segment_id)
    }
}

// ── LayerBuilder ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LayerBuilder {
    config: BuilderConfig,
    mesh: Mesh,
}

impl LayerBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        let mesh = Mesh::new(config.num_devices);
        Self { config, mesh }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Split annotation across dim 0.
    pub fn split(&self, name: &str, x: &Tensor) -> Result<Tensor> {
        self.mesh.split(name, x)
    }

    /// Build one sub-layer. `scope` names its sharding annotations; `vb`
    /// should already be scoped to the sub-layer.
    pub fn sub_layer(&self, kind: SubLayerKind, scope: &str, vb: VarBuilder) -> Result<SubLayer> {
        let flavor = match kind {
            SubLayerKind::SelfAttention => AttentionFlavor::Encoder,
            SubLayerKind::DecSelfAttention | SubLayerKind::DecSelfAttentionRelativeBias
                if self.config.uses_relative_bias(kind) =>
            {
                AttentionFlavor::DecoderSelfRelative
            }
            SubLayerKind::DecSelfAttention | SubLayerKind::DecSelfAttentionRelativeBias => {
                AttentionFlavor::DecoderSelf
            }
            SubLayerKind::DecEncAttention => AttentionFlavor::DecoderEncoder,
            SubLayerKind::DenseReluDense | SubLayerKind::DenseReluDenseGatedGelu => {
                let gated = kind == SubLayerKind::DenseReluDenseGatedGelu;
                return Ok(SubLayer::Dense {
                    ffn: DenseReluDense::new(&self.config, gated, vb)?,
                    mesh: self.mesh.clone(),
                    scope: scope.to_string(),
                });
            }
            SubLayerKind::Moe => {
                return Ok(SubLayer::Moe(MoeLayer::new(&self.config, &self.mesh, scope, vb)?));
            }
        };
        Ok(SubLayer::Attention(BuilderAttention::new(
            &self.config,
            &self.mesh,
            scope,
            flavor,
            vb,
        )?))
    }

    /// Residual wrapper around one sub-layer, with its own `ln`.
    pub fn residual_layer(&self, kind: SubLayerKind, scope: &str, vb: VarBuilder) -> Result<ResidualLayer> {
        let inner_scope = format!("{scope}/{}", kind.scope());
        Ok(ResidualLayer {
            ln: NormLayer::rms(self.config.model_dim, self.config.layer_norm_epsilon, vb.pp("ln"))?,
            layer: self.sub_layer(kind, &inner_scope, vb.pp(kind.scope()))?,
            dropout: Dropout::from_builder(self.config.dropout_rate, &self.config),
        })
    }

    fn layer_stack(
        &self,
        name: &str,
        sub_layers: &[SubLayerKind],
        num: usize,
        decoder: bool,
        vb: VarBuilder,
    ) -> Result<LayerStack> {
        let mut layers = Vec::with_capacity(sub_layers.len() * num);
        for _ in 0..num {
            for &kind in sub_layers {
                let valid = if decoder {
                    kind.is_decoder_layer()
                } else {
                    kind.is_encoder_layer()
                };
                if !valid {
                    candle_core::bail!("{name}: {kind:?} cannot be used in this stack");
                }
                let layer_name = format!("layer_{:03}", layers.len());
                let scope = format!("{name}/{layer_name}");
                layers.push(self.residual_layer(kind, &scope, vb.pp(&layer_name))?);
            }
        }
        tracing::info!(
            stack = name,
            layers = layers.len(),
            num_devices = self.mesh.num_devices(),
            "built layer stack"
        );
        Ok(LayerStack {
            name: name.to_string(),
            mesh: self.mesh.clone(),
            layers,
            final_layer_norm: NormLayer::rms(
                self.config.model_dim,
                self.config.layer_norm_epsilon,
                vb.pp("final_layer_norm"),
            )?,
            input_dropout: Dropout::from_builder(self.config.dropout_rate, &self.config),
            output_dropout: Dropout::from_builder(self.config.dropout_rate, &self.config),
            decoder,
        })
    }

    pub fn encoder_layer_stack(
        &self,
        name: &str,
        sub_layers: &[SubLayerKind],
        num: usize,
        vb: VarBuilder,
    ) -> Result<LayerStack> {
        self.layer_stack(name, sub_layers, num, false, vb)
    }

    pub fn decoder_layer_stack(
        &self,
        name: &str,
        sub_layers: &[SubLayerKind],
        num: usize,
        vb: VarBuilder,
    ) -> Result<LayerStack> {
        self.layer_stack(name, sub_layers, num, true, vb)
    }

    pub fn embedding(&self, vocab_size: usize, vb: VarBuilder) -> Result<Embedding> {
        Embedding::new(vocab_size, &self.config, &self.mesh, vb)
    }

    pub fn smoothed_softmax(&self, vocab_size: usize, vb: VarBuilder) -> Result<SmoothedSoftmax> {
        SmoothedSoftmax::new(vocab_size, &self.config, &self.mesh, vb)
    }
}
