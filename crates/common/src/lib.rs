//! # gshard-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** / **[`BuilderConfig`]** — GShard model hyper-parameters (JSON).
//! * **[`AttentionConfig`]** / **[`TransformerLayerConfig`]** — batch-major layer settings.
//! * **[`MmapDataset`]** / **[`SequencePacker`]** — token files and packed batches.

pub mod config;
pub mod data;

pub use config::{
    AttentionConfig, AttentionKind, BuilderConfig, ModelConfig, RelativeAttentionType,
    SecondExpertPolicy, StackConfig, StackedTransformerConfig, SubLayerKind,
    TransformerLayerConfig,
};
pub use data::{
    tokenize_documents, write_tokenized_file, BatchDataset, MmapDataset, PackedBatch, PackedTensors, SequencePacker,
};
