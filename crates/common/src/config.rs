//! Model configuration for gshard-rs.
//!
//! Serialised as JSON next to checkpoints. Every field has a default so a
//! minimal `{}` JSON still produces a working (if small) model.
//!
//! | Type | Used by |
//! |------|---------|
//! | [`BuilderConfig`] | GShard layer builder: attention, dense FFN, MoE sub-layers |
//! | [`ModelConfig`] | Full encoder/decoder model: vocabulary, stacks, softmax losses |
//! | [`AttentionConfig`] | Batch-major multi-headed attention and its relative variants |
//! | [`TransformerLayerConfig`] / [`StackedTransformerConfig`] | Batch-major transformer layers |

use serde::{Deserialize, Serialize};

// ── Enumerations ────────────────────────────────────────────────────────────

/// How the second-best expert is chosen and whether the token is sent to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecondExpertPolicy {
    /// Always dispatch to the second expert (subject to capacity).
    #[default]
    All,
    /// Draw the second expert from the router distribution (Gumbel-max).
    Sampling,
    /// Dispatch with probability proportional to the second gate.
    Random,
}

/// Relative attention flavour for decoder self-attention in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeAttentionType {
    /// Per-head learned bias indexed by relative position bucket.
    Bias,
}

/// A sub-layer wrapped by an encoder or decoder layer of the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubLayerKind {
    SelfAttention,
    DecSelfAttention,
    DecSelfAttentionRelativeBias,
    DecEncAttention,
    DenseReluDense,
    DenseReluDenseGatedGelu,
    Moe,
}

impl SubLayerKind {
    /// Default variable scope name for the sub-layer.
    pub fn scope(&self) -> &'static str {
        match self {
            Self::SelfAttention => "self_attention",
            Self::DecSelfAttention => "dec_self_attention",
            Self::DecSelfAttentionRelativeBias => "dec_self_attention",
            Self::DecEncAttention => "dec_enc_attention",
            Self::DenseReluDense => "dense_relu_dense",
            Self::DenseReluDenseGatedGelu => "dense_relu_dense",
            Self::Moe => "moe",
        }
    }

    /// Valid inside a decoder stack.
    pub fn is_decoder_layer(&self) -> bool {
        !matches!(self, Self::SelfAttention)
    }

    /// Valid inside an encoder stack.
    pub fn is_encoder_layer(&self) -> bool {
        matches!(
            self,
            Self::SelfAttention | Self::DenseReluDense | Self::DenseReluDenseGatedGelu | Self::Moe
        )
    }
}

// ── BuilderConfig ───────────────────────────────────────────────────────────

/// Hyper-parameters shared by every layer the builder constructs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    // ── Mesh ────────────────────────────────────────────────────────────────
    /// Number of devices tensors are split over along dim 0.
    #[serde(default = "default_one")]
    pub num_devices: usize,
    /// Number of MoE token groups. `None` uses `num_devices`.
    #[serde(default)]
    pub num_groups: Option<usize>,

    // ── Dimensions ──────────────────────────────────────────────────────────
    #[serde(default = "default_model_dim")]
    pub model_dim: usize,
    #[serde(default = "default_one")]
    pub attention_num_heads: usize,
    /// Shared dimensionality of attention keys and values.
    #[serde(default = "default_key_value_dim")]
    pub attention_key_value_dim: usize,
    /// Store attention weights with heads and key/value dims merged.
    #[serde(default)]
    pub attention_combine_dims: bool,
    /// Extra logit joining every attention softmax normaliser.
    #[serde(default)]
    pub attention_extra_logit: Option<f64>,
    /// DenseReluDense hidden dim.
    #[serde(default = "default_ff_dim")]
    pub ff_dim: usize,

    // ── Regularisation ──────────────────────────────────────────────────────
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    /// Universal dropout rate: inputs, attention weights, residual, FFN hidden.
    #[serde(default)]
    pub dropout_rate: f64,
    /// Dims along which dropout noise is broadcast (negative values count
    /// from the end).
    #[serde(default)]
    pub noise_shape_broadcast_dims: Option<Vec<isize>>,
    #[serde(default)]
    pub moe_dropout_rate: f64,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,

    // ── Mixture-of-Experts ──────────────────────────────────────────────────
    /// Number of experts.
    #[serde(default = "default_e_dim")]
    pub e_dim: usize,
    /// Per-expert capacity. Ignored when `capacity_factor` is set.
    #[serde(default)]
    pub c_dim: Option<usize>,
    #[serde(default)]
    pub capacity_factor: Option<f64>,
    #[serde(default = "default_moe_hidden_dim")]
    pub moe_hidden_dim: usize,
    #[serde(default)]
    pub second_expert_policy: SecondExpertPolicy,
    #[serde(default)]
    pub second_expert_threshold: f64,
    /// Renormalise top-2 gates before capacity dropping instead of after.
    #[serde(default = "default_true")]
    pub legacy_mtf_behavior: bool,

    // ── Relative attention ──────────────────────────────────────────────────
    #[serde(default)]
    pub relative_attention_type: Option<RelativeAttentionType>,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    /// Use `0..len` positions instead of segment positions for the bias.
    #[serde(default)]
    pub relative_attention_use_universal_1d_position: bool,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_one() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_model_dim() -> usize {
    256
}
fn default_key_value_dim() -> usize {
    64
}
fn default_ff_dim() -> usize {
    1024
}
fn default_layer_norm_epsilon() -> f64 {
    1e-6
}
fn default_label_smoothing() -> f64 {
    0.1
}
fn default_e_dim() -> usize {
    8
}
fn default_moe_hidden_dim() -> usize {
    512
}
fn default_num_buckets() -> usize {
    32
}
fn default_max_distance() -> usize {
    128
}
fn default_vocab_size() -> usize {
    32000
}
fn default_max_len() -> usize {
    256
}
fn default_z_loss_coef() -> f64 {
    1e-4
}
fn default_aux_loss_coef() -> f64 {
    0.01
}
fn default_eos_id() -> u32 {
    1
}
fn default_num_layers() -> usize {
    2
}
fn default_decoder_sub_layers() -> Vec<SubLayerKind> {
    vec![
        SubLayerKind::DecSelfAttention,
        SubLayerKind::Moe,
        SubLayerKind::DecSelfAttention,
        SubLayerKind::DenseReluDense,
    ]
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            num_devices: 1,
            num_groups: None,
            model_dim: default_model_dim(),
            attention_num_heads: 4,
            attention_key_value_dim: default_key_value_dim(),
            attention_combine_dims: false,
            attention_extra_logit: None,
            ff_dim: default_ff_dim(),
            layer_norm_epsilon: default_layer_norm_epsilon(),
            dropout_rate: 0.0,
            noise_shape_broadcast_dims: None,
            moe_dropout_rate: 0.0,
            label_smoothing: default_label_smoothing(),
            e_dim: default_e_dim(),
            c_dim: None,
            capacity_factor: Some(2.0),
            moe_hidden_dim: default_moe_hidden_dim(),
            second_expert_policy: SecondExpertPolicy::All,
            second_expert_threshold: 0.0,
            legacy_mtf_behavior: true,
            relative_attention_type: None,
            relative_attention_num_buckets: default_num_buckets(),
            relative_attention_max_distance: default_max_distance(),
            relative_attention_use_universal_1d_position: false,
        }
    }
}

impl BuilderConfig {
    /// Effective number of MoE groups.
    pub fn num_groups(&self) -> usize {
        self.num_groups.unwrap_or(self.num_devices).max(1)
    }

    /// Per-expert capacity for a group of `group_size` tokens.
    ///
    /// `capacity_factor` takes precedence over `c_dim`; with neither set every
    /// token of the group fits in one expert.
    pub fn expert_capacity(&self, group_size: usize) -> usize {
        if let Some(cf) = self.capacity_factor {
            let c = (cf * group_size as f64 / self.e_dim.max(1) as f64).ceil() as usize;
            c.max(1)
        } else {
            self.c_dim.unwrap_or(group_size).max(1)
        }
    }

    /// Whether sub-layer `kind` carries a learned relative position bias.
    /// `relative_attention_type = bias` upgrades plain decoder self-attention.
    pub fn uses_relative_bias(&self, kind: SubLayerKind) -> bool {
        match kind {
            SubLayerKind::DecSelfAttentionRelativeBias => true,
            SubLayerKind::DecSelfAttention => {
                self.relative_attention_type == Some(RelativeAttentionType::Bias)
            }
            _ => false,
        }
    }

    /// Attention projection width (`heads × key_value_dim`).
    pub fn attention_hidden_dim(&self) -> usize {
        self.attention_num_heads * self.attention_key_value_dim
    }

    /// Check internal consistency. Called before any layer is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.num_devices >= 1, "num_devices must be >= 1");
        anyhow::ensure!(self.model_dim > 0, "model_dim must be > 0");
        anyhow::ensure!(
            self.attention_num_heads > 0 && self.attention_key_value_dim > 0,
            "attention_num_heads and attention_key_value_dim must be > 0"
        );
        anyhow::ensure!(self.e_dim >= 2, "top-2 gating needs e_dim >= 2, got {}", self.e_dim);
        anyhow::ensure!(
            (0.0..1.0).contains(&self.dropout_rate) && (0.0..1.0).contains(&self.moe_dropout_rate),
            "dropout rates must be in [0, 1)"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.label_smoothing),
            "label_smoothing must be in [0, 1)"
        );
        anyhow::ensure!(
            self.relative_attention_num_buckets >= 2,
            "relative_attention_num_buckets must be >= 2"
        );
        anyhow::ensure!(
            self.relative_attention_max_distance > self.relative_attention_num_buckets / 2,
            "relative_attention_max_distance must exceed num_buckets / 2"
        );
        Ok(())
    }
}

// ── ModelConfig ─────────────────────────────────────────────────────────────

/// A repeated block of builder sub-layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Sub-layers applied in order; each is wrapped in its own residual layer.
    pub sub_layers: Vec<SubLayerKind>,
    /// How many times `sub_layers` is repeated.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
}

impl StackConfig {
    /// Total number of residual layers in the stack.
    pub fn depth(&self) -> usize {
        self.sub_layers.len() * self.num_layers
    }
}

/// Configuration of a full MoE transformer language/translation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Maximum segment length (size of the learned position embedding).
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default)]
    pub builder: BuilderConfig,
    /// Encoder stack. `None` makes the model decoder-only.
    #[serde(default)]
    pub encoder: Option<StackConfig>,
    #[serde(default = "default_decoder_stack")]
    pub decoder: StackConfig,
    /// Clip softmax logits to `[-max, max]`.
    #[serde(default)]
    pub logits_abs_max: Option<f64>,
    #[serde(default = "default_z_loss_coef")]
    pub z_loss_coef: f64,
    /// Weight of the summed MoE load-balancing loss in the training objective.
    #[serde(default = "default_aux_loss_coef")]
    pub aux_loss_coef: f64,
    /// Divide per-example loss by label length rather than non-padding count.
    #[serde(default = "default_true")]
    pub use_tgt_labels_size_as_loss_denominator: bool,
    /// Document separator in token files; ends generation.
    #[serde(default = "default_eos_id")]
    pub eos_id: u32,
}

fn default_decoder_stack() -> StackConfig {
    StackConfig {
        sub_layers: default_decoder_sub_layers(),
        num_layers: default_num_layers(),
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            max_len: default_max_len(),
            builder: BuilderConfig::default(),
            encoder: None,
            decoder: default_decoder_stack(),
            logits_abs_max: None,
            z_loss_coef: default_z_loss_coef(),
            aux_loss_coef: default_aux_loss_coef(),
            use_tgt_labels_size_as_loss_denominator: true,
            eos_id: default_eos_id(),
        }
    }
}

impl ModelConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn is_decoder_only(&self) -> bool {
        self.encoder.is_none()
    }

    /// Check builder parameters and that every sub-layer fits its stack.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.builder.validate()?;
        anyhow::ensure!(self.vocab_size > 0, "vocab_size must be > 0");
        anyhow::ensure!((self.eos_id as usize) < self.vocab_size, "eos_id out of vocabulary");
        if let Some(enc) = &self.encoder {
            for kind in &enc.sub_layers {
                anyhow::ensure!(kind.is_encoder_layer(), "{kind:?} is not an encoder sub-layer");
            }
        }
        for kind in &self.decoder.sub_layers {
            anyhow::ensure!(kind.is_decoder_layer(), "{kind:?} is not a decoder sub-layer");
            if *kind == SubLayerKind::DecEncAttention {
                anyhow::ensure!(
                    self.encoder.is_some(),
                    "dec_enc_attention requires an encoder stack"
                );
            }
        }
        Ok(())
    }
}

// ── Batch-major attention ───────────────────────────────────────────────────

/// Which attention computation a batch-major layer runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionKind {
    /// Plain scaled dot-product attention.
    Dot,
    /// Transformer-XL relative attention with sinusoidal position embeddings.
    Xl {
        rel_pos_emb_dim: usize,
        #[serde(default)]
        skip_term_b: bool,
    },
    /// Shaw et al. relative position representations, clipped at `radius`.
    Rpe { radius: usize },
    /// Block-local causal attention.
    LocalCausal {
        block_size: usize,
        left_context: usize,
        #[serde(default)]
        right_context: usize,
    },
    /// Local causal window with Transformer-XL relative logits.
    LocalCausalXl {
        block_size: usize,
        left_context: usize,
        #[serde(default)]
        right_context: usize,
        rel_pos_emb_dim: usize,
        #[serde(default)]
        skip_term_b: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub num_heads: usize,
    #[serde(default)]
    pub atten_dropout_prob: f64,
    #[serde(default = "default_true")]
    pub use_bias: bool,
    /// Learned per-dimension query scale instead of `dim_per_head^-0.5`.
    #[serde(default)]
    pub enable_per_dim_scale: bool,
    /// Inputs carry segment ids; a segment mask is expected.
    #[serde(default)]
    pub packed_input: bool,
    #[serde(default = "default_attention_kind")]
    pub kind: AttentionKind,
}

fn default_attention_kind() -> AttentionKind {
    AttentionKind::Dot
}

impl AttentionConfig {
    pub fn new(input_dim: usize, hidden_dim: usize, num_heads: usize) -> Self {
        Self {
            input_dim,
            hidden_dim,
            num_heads,
            atten_dropout_prob: 0.0,
            use_bias: true,
            enable_per_dim_scale: false,
            packed_input: false,
            kind: AttentionKind::Dot,
        }
    }

    /// Per-head dimension (`hidden_dim / num_heads`).
    pub fn dim_per_head(&self) -> anyhow::Result<usize> {
        anyhow::ensure!(
            self.num_heads > 0 && self.hidden_dim % self.num_heads == 0,
            "hidden_dim ({}) must be divisible by num_heads ({})",
            self.hidden_dim,
            self.num_heads,
        );
        Ok(self.hidden_dim / self.num_heads)
    }
}

// ── Batch-major transformer layers ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerLayerConfig {
    /// Self-attention settings; `input_dim` is the model dim.
    pub self_atten: AttentionConfig,
    /// Cross-attention over encoder outputs.
    #[serde(default)]
    pub has_aux_atten: bool,
    /// Causal self-attention.
    #[serde(default)]
    pub mask_self_atten: bool,
    /// Feed-forward hidden dim.
    pub ff_hidden_dim: usize,
    #[serde(default)]
    pub residual_dropout_prob: f64,
    #[serde(default)]
    pub relu_dropout_prob: f64,
    #[serde(default = "default_transformer_ln_eps")]
    pub layer_norm_epsilon: f64,
}

fn default_transformer_ln_eps() -> f64 {
    1e-6
}

impl TransformerLayerConfig {
    /// Layer with dot attention over `model_dim`, `num_heads` heads and an
    /// FFN of `ff_hidden_dim`; `dropout_prob` applies to every dropout site.
    pub fn new(model_dim: usize, ff_hidden_dim: usize, num_heads: usize, dropout_prob: f64) -> Self {
        let mut self_atten = AttentionConfig::new(model_dim, model_dim, num_heads);
        self_atten.atten_dropout_prob = dropout_prob;
        Self {
            self_atten,
            has_aux_atten: false,
            mask_self_atten: false,
            ff_hidden_dim,
            residual_dropout_prob: dropout_prob,
            relu_dropout_prob: dropout_prob,
            layer_norm_epsilon: default_transformer_ln_eps(),
        }
    }

    pub fn model_dim(&self) -> usize {
        self.self_atten.input_dim
    }
}

/// A stack of identical batch-major transformer layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackedTransformerConfig {
    pub num_layers: usize,
    pub mdl_dim: usize,
    pub hidden_dim: usize,
    pub num_atten_heads: usize,
    #[serde(default)]
    pub dropout_prob: f64,
    #[serde(default)]
    pub has_aux_atten: bool,
    #[serde(default)]
    pub mask_self_atten: bool,
    /// Apply a final layer norm after the last layer.
    #[serde(default)]
    pub final_layer_norm: bool,
}

impl StackedTransformerConfig {
    /// Configuration of every layer in the stack.
    pub fn layer_config(&self) -> TransformerLayerConfig {
        let mut cfg = TransformerLayerConfig::new(
            self.mdl_dim,
            self.hidden_dim,
            self.num_atten_heads,
            self.dropout_prob,
        );
        cfg.has_aux_atten = self.has_aux_atten;
        cfg.mask_self_atten = self.mask_self_atten;
        cfg
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_json_round_trip() {
        let config = ModelConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.vocab_size, loaded.vocab_size);
        assert_eq!(config.builder.model_dim, loaded.builder.model_dim);
        assert_eq!(config.decoder.sub_layers, loaded.decoder.sub_layers);
        assert_eq!(loaded.builder.second_expert_policy, SecondExpertPolicy::All);
        assert!(loaded.builder.legacy_mtf_behavior);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let loaded: ModelConfig = serde_json::from_str("{}").unwrap();
        assert!(loaded.is_decoder_only());
        assert_eq!(loaded.builder.layer_norm_epsilon, 1e-6);
        assert_eq!(loaded.builder.relative_attention_num_buckets, 32);
        assert_eq!(loaded.builder.relative_attention_max_distance, 128);
        assert_eq!(loaded.z_loss_coef, 1e-4);
        loaded.validate().unwrap();
    }

    #[test]
    fn partial_builder_json() {
        let json = r#"{
            "builder": {
                "num_devices": 2,
                "model_dim": 32,
                "e_dim": 4,
                "second_expert_policy": "random",
                "relative_attention_type": "bias"
            },
            "decoder": {"sub_layers": ["dec_self_attention_relative_bias", "moe"]}
        }"#;
        let loaded: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(loaded.builder.num_groups(), 2);
        assert_eq!(loaded.builder.second_expert_policy, SecondExpertPolicy::Random);
        assert_eq!(loaded.builder.relative_attention_type, Some(RelativeAttentionType::Bias));
        assert_eq!(loaded.decoder.num_layers, 2);
        assert_eq!(loaded.decoder.depth(), 4);
    }

    #[test]
    fn expert_capacity_rules() {
        let mut b = BuilderConfig {
            e_dim: 4,
            capacity_factor: Some(2.0),
            ..Default::default()
        };
        // ceil(2.0 * 10 / 4) = 5
        assert_eq!(b.expert_capacity(10), 5);
        b.capacity_factor = None;
        b.c_dim = Some(3);
        assert_eq!(b.expert_capacity(10), 3);
        b.c_dim = None;
        assert_eq!(b.expert_capacity(10), 10);
    }

    #[test]
    fn validate_rejects_misplaced_sub_layers() {
        let mut config = ModelConfig::default();
        config.decoder.sub_layers = vec![SubLayerKind::SelfAttention];
        assert!(config.validate().is_err());

        let mut config = ModelConfig::default();
        config.decoder.sub_layers = vec![SubLayerKind::DecEncAttention];
        assert!(config.validate().is_err());
        config.encoder = Some(StackConfig {
            sub_layers: vec![SubLayerKind::SelfAttention],
            num_layers: 1,
        });
        config.validate().unwrap();
    }

    #[test]
    fn attention_kind_tagged_json() {
        let json = r#"{"input_dim": 16, "hidden_dim": 16, "num_heads": 2,
                       "kind": {"type": "local_causal", "block_size": 4, "left_context": 3}}"#;
        let cfg: AttentionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            cfg.kind,
            AttentionKind::LocalCausal {
                block_size: 4,
                left_context: 3,
                right_context: 0
            }
        );
        assert_eq!(cfg.dim_per_head().unwrap(), 8);
        assert!(cfg.use_bias);
    }

    #[test]
    fn dim_per_head_rejects_uneven_heads() {
        assert!(AttentionConfig::new(8, 10, 4).dim_per_head().is_err());
        assert!(AttentionConfig::new(8, 8, 0).dim_per_head().is_err());
        assert_eq!(AttentionConfig::new(8, 12, 3).dim_per_head().unwrap(), 4);
    }

    #[test]
    fn stacked_layer_config_propagates_flags() {
        let stack = StackedTransformerConfig {
            num_layers: 2,
            mdl_dim: 16,
            hidden_dim: 32,
            num_atten_heads: 4,
            dropout_prob: 0.1,
            has_aux_atten: true,
            mask_self_atten: true,
            final_layer_norm: false,
        };
        let layer = stack.layer_config();
        assert!(layer.has_aux_atten && layer.mask_self_atten);
        assert_eq!(layer.model_dim(), 16);
        assert_eq!(layer.self_atten.num_heads, 4);
        assert_eq!(layer.ff_hidden_dim, 32);
    }
}
