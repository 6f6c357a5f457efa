//! Sharded Mixture-of-Experts position-wise feed-forward layer.
//!
//! ```text
//! x [B, L, M] ──reshape──▶ [G, S, M] ──top-2 gating──▶ combine/dispatch [G, S, E, C]
//!                                   │
//!            dispatch (GSEC,GSM→EGCM, split on E)
//!                                   ▼
//!               relu(x · wi[e]) · wo[e]   per expert
//!                                   │
//!            combine (GSEC,EGCM→GSM) ──reshape──▶ [B, L, M]
//! ```
//!
//! Expert weights are [`ShardedVar`]s split on the expert dimension, so `E`
//! must be a multiple of the mesh size.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

use gshard_common::BuilderConfig;

use crate::gating::{top2_gating, GatingOptions};
use crate::ops::{fan_in_uniform, Dropout};
use crate::sharding::{Mesh, ShardedVar};

pub struct MoeLayer {
    config: BuilderConfig,
    mesh: Mesh,
    scope: String,
    gating: Tensor,
    wi: ShardedVar,
    wo: ShardedVar,
    dropout: Dropout,
}

impl MoeLayer {
    /// Parameters: `<vb>/wi [E, M, H]`, `<vb>/wo [E, H, M]` and
    /// `<vb>/top_2_gating/w [M, E]`. `scope` prefixes the sharding annotations.
    pub fn new(config: &BuilderConfig, mesh: &Mesh, scope: &str, vb: VarBuilder) -> Result<Self> {
        let (e, m, h) = (config.e_dim, config.model_dim, config.moe_hidden_dim);
        let n = mesh.num_devices();
        let wi = ShardedVar::new(&vb, "wi", (e, m, h), fan_in_uniform(m), n)?;
        let wo = ShardedVar::new(&vb, "wo", (e, h, m), fan_in_uniform(h), n)?;
        let gating = vb
            .pp("top_2_gating")
            .get_with_hints((m, e), "w", fan_in_uniform(m))?;
        tracing::debug!(
            scope,
            experts = e,
            hidden = h,
            shard = ?wi.shard_shape(),
            "moe layer"
        );
        Ok(Self {
            config: config.clone(),
            mesh: mesh.clone(),
            scope: scope.to_string(),
            gating,
            wi,
            wo,
            dropout: Dropout::from_builder(config.moe_dropout_rate, config),
        })
    }

    pub fn num_experts(&self) -> usize {
        self.config.e_dim
    }

    pub fn expert_weights(&self) -> (&ShardedVar, &ShardedVar) {
        (&self.wi, &self.wo)
    }

    fn annotate(&self, suffix: &str, x: &Tensor) -> Result<Tensor> {
        self.mesh.split(&format!("{}/{suffix}", self.scope), x)
    }

    /// `x: [B, L, M]`, `segment_id: [B, L]` → `(outputs [B, L, M], aux_loss)`.
    pub fn forward_t(&self, x: &Tensor, segment_id: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        self.forward_groups(x, segment_id, self.config.num_groups(), train)
    }

    /// [`Self::forward_t`] with an explicit group count. Incremental decoding
    /// routes each step's `B` tokens as one group.
    pub fn forward_groups(
        &self,
        x: &Tensor,
        segment_id: &Tensor,
        g: usize,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let x = self.annotate("inputs_split", x)?;
        let segment_id = self.annotate("segment_id_split", segment_id)?;
        let (b, l, m) = x.dims3()?;
        let g = g.max(1);
        let tokens = b * l;
        if tokens % g != 0 {
            candle_core::bail!(
                "{}: {tokens} tokens ({b}x{l}) cannot be split into {g} groups",
                self.scope
            );
        }
        let s = tokens / g;
        let e = self.config.e_dim;

        let grouped = self.annotate("reshaped_inputs", &x.reshape((g, s, m))?)?;
        let paddings = segment_id
            .to_dtype(DType::F32)?
            .eq(0f32)?
            .to_dtype(DType::F32)?
            .reshape((g, s))?;
        let options = GatingOptions::from_builder(&self.config, s);
        let c = options.capacity;
        tracing::trace!(scope = %self.scope, groups = g, group_size = s, capacity = c, "moe dispatch");
        let gating = top2_gating(&self.gating, &grouped, Some(&paddings), &options, train)?;

        // GSEC,GSM -> EGCM
        let dispatch = gating
            .dispatch_tensor
            .reshape((g, s, e * c))?
            .transpose(1, 2)?
            .contiguous()?;
        let expert_inputs = dispatch
            .matmul(&grouped)?
            .reshape((g, e, c, m))?
            .permute((1, 0, 2, 3))?
            .contiguous()?
            .reshape((e, g * c, m))?;
        let expert_inputs = self.annotate("expert_inputs", &expert_inputs)?;

        let hidden = expert_inputs.matmul(self.wi.as_tensor())?.relu()?;
        let hidden = self.dropout.forward_t(&hidden, train)?;
        let expert_outputs = self.annotate("expert_outputs", &hidden.matmul(self.wo.as_tensor())?)?;

        // GSEC,EGCM -> GSM
        let expert_outputs = expert_outputs
            .reshape((e, g, c, m))?
            .permute((1, 0, 2, 3))?
            .contiguous()?
            .reshape((g, e * c, m))?;
        let combined = gating
            .combine_tensor
            .reshape((g, s, e * c))?
            .matmul(&expert_outputs)?;
        let outputs = self.annotate("outputs_split", &combined.reshape((b, l, m))?)?;
        Ok((outputs, gating.aux_loss))
    }
}
