//! # gshard-core — Layers and Models
//!
//! Every compute primitive needed to build, train and decode a sharded
//! Mixture-of-Experts transformer lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`ops`] | one-hot, exclusive cumsum, padding helpers, extra-logit softmax, initialisers, `Dropout` |
//! | [`sharding`] | `Mesh`, split annotations, `ShardedVar` |
//! | [`masks`] | attention biases, segment masks, causal/local paddings, relative buckets |
//! | [`norm`] | `NormLayer` (RMSNorm / LayerNorm) |
//! | [`ffn`] | `DenseReluDense`, `TransformerFeedForward` |
//! | [`gating`] | `top2_gating` with capacity and second-expert policies |
//! | [`moe`] | `MoeLayer` (dispatch → experts → combine) |
//! | [`builder`] | `LayerBuilder`, encoder/decoder `LayerStack`s, embedding softmax |
//! | [`relative`] | Transformer-XL and RPE relative position terms |
//! | [`local`] | block-wise local causal attention |
//! | [`attention`] | batch-major `MultiHeadedAttention` with `AttentionState` |
//! | [`transformer`] | batch-major transformer layers and stacks |
//! | [`model`] | `MoeTransformer`, `ParamStats` |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Annotate, don't move.** Sharding is recorded on a `Mesh`; the math is
//!    the same on one device as on many.
//! 3. **Decode equals forward.** Every `extend_step` reproduces the causal
//!    full-sequence pass one position at a time.

pub mod attention;
pub mod builder;
pub mod ffn;
pub mod gating;
pub mod local;
pub mod masks;
pub mod model;
pub mod moe;
pub mod norm;
pub mod ops;
pub mod relative;
pub mod sharding;
pub mod transformer;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use attention::{AttentionState, MultiHeadedAttention};
pub use builder::{DecoderState, EncoderContext, LayerBuilder, LayerStack, Segments};
pub use gating::{top2_gating, GatingOptions, GatingOutput};
pub use model::{param_stats, DecodeState, ModelOutput, MoeTransformer, ParamStats, SourceBatch};
pub use moe::MoeLayer;
pub use sharding::{Mesh, ShardedVar, ShardingLog, ShardingSpec};
pub use transformer::{
    clear_relative_attention, use_relative_attention, RelativeAttentionKind,
    StackedTransformerLayers, TransformerDecoderLayer, TransformerLayer,
};
