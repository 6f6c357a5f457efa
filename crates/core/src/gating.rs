//! Top-2 gating for Mixture-of-Experts dispatch.
//!
//! Tokens arrive grouped as `[G, S, M]` (groups × group size × model dim).
//! Each token is routed to its best expert and, depending on the
//! [`SecondExpertPolicy`], to its second best. Every expert accepts at most
//! `capacity` tokens per group; overflowing tokens are dropped in token order,
//! first-choice assignments taking precedence over second choices.
//!
//! The result is expressed as two `[G, S, E, C]` tensors:
//!
//! * `combine_tensor` — gate weight of token `s` in slot `c` of expert `e`.
//! * `dispatch_tensor` — 1.0 where `combine_tensor > 0`.

use candle_core::{DType, Result, Tensor, D};

use gshard_common::{BuilderConfig, SecondExpertPolicy};

use crate::ops::{apply_padding, exclusive_cumsum, linear_last, one_hot, LARGE_NEGATIVE};

/// Routing knobs, usually taken from [`BuilderConfig`].
#[derive(Debug, Clone)]
pub struct GatingOptions {
    pub num_experts: usize,
    pub capacity: usize,
    pub second_expert_policy: SecondExpertPolicy,
    pub second_expert_threshold: f64,
    pub legacy_mtf_behavior: bool,
}

impl GatingOptions {
    /// Options for groups of `group_size` tokens.
    pub fn from_builder(config: &BuilderConfig, group_size: usize) -> Self {
        Self {
            num_experts: config.e_dim,
            capacity: config.expert_capacity(group_size),
            second_expert_policy: config.second_expert_policy,
            second_expert_threshold: config.second_expert_threshold,
            legacy_mtf_behavior: config.legacy_mtf_behavior,
        }
    }
}

pub struct GatingOutput {
    /// `[G, S, E, C]`
    pub combine_tensor: Tensor,
    /// `[G, S, E, C]`
    pub dispatch_tensor: Tensor,
    /// Scalar load-balancing loss.
    pub aux_loss: Tensor,
}

/// Route `inputs: [G, S, M]` with gating weights `w: [M, E]`.
///
/// `paddings: [G, S]` holds 1.0 for padded tokens, which are never dispatched
/// and do not count towards the load-balancing loss. The stochastic policies
/// only sample when `train` is set; otherwise they behave like
/// [`SecondExpertPolicy::All`].
pub fn top2_gating(
    w: &Tensor,
    inputs: &Tensor,
    paddings: Option<&Tensor>,
    opts: &GatingOptions,
    train: bool,
) -> Result<GatingOutput> {
    let (g, s, _m) = inputs.dims3()?;
    let e = opts.num_experts;
    let c = opts.capacity;
    if w.dim(1)? != e {
        candle_core::bail!("gating weights {:?} do not match {e} experts", w.dims());
    }

    let logits = linear_last(inputs, w)?;
    let raw_gates = candle_nn::ops::softmax(&logits, D::Minus1)?;
    let nonpadding = paddings
        .map(|p| p.to_dtype(DType::F32)?.affine(-1.0, 1.0)?.unsqueeze(2))
        .transpose()?;
    let mask_nonpadding = |t: Tensor| -> Result<Tensor> {
        match &nonpadding {
            Some(np) => t.broadcast_mul(np),
            None => Ok(t),
        }
    };

    // ── First expert ────────────────────────────────────────────────────────
    let index_1 = raw_gates.argmax(D::Minus1)?;
    let top_1 = one_hot(&index_1, e, DType::F32)?;
    let mask_1 = mask_nonpadding(top_1.clone())?;
    let gate_1 = (&raw_gates * &mask_1)?.sum(D::Minus1)?;

    // Fraction of tokens whose first choice is each expert, against the mean
    // router probability per expert.
    let density_1 = mask_1.mean(1)?;
    let density_1_proxy = mask_nonpadding(raw_gates.clone())?.mean(1)?;
    let aux_loss = ((density_1_proxy * density_1)?.mean_all()? * (e * e) as f64)?;

    // ── Second expert ───────────────────────────────────────────────────────
    let gates_without_top_1 = (&raw_gates * top_1.affine(-1.0, 1.0)?)?;
    let index_2 = if train && opts.second_expert_policy == SecondExpertPolicy::Sampling {
        let u = Tensor::rand(1e-6f32, 1.0 - 1e-6, logits.dims(), logits.device())?;
        let gumbel = u.log()?.neg()?.log()?.neg()?;
        apply_padding(&(&logits + gumbel)?, &top_1, LARGE_NEGATIVE)?.argmax(D::Minus1)?
    } else {
        gates_without_top_1.argmax(D::Minus1)?
    };
    let mut mask_2 = mask_nonpadding(one_hot(&index_2, e, DType::F32)?)?;
    let mut gate_2 = (&raw_gates * &mask_2)?.sum(D::Minus1)?;

    let (mut gate_1, mut gate_2_norm) = if opts.legacy_mtf_behavior {
        let denom = ((&gate_1 + &gate_2)? + 1e-9)?;
        (gate_1.div(&denom)?, gate_2.div(&denom)?)
    } else {
        (gate_1, gate_2.clone())
    };

    // ── Second-expert dispatch filter ───────────────────────────────────────
    let keep_2 = match opts.second_expert_policy {
        SecondExpertPolicy::Random if train => {
            let u = Tensor::rand(0f32, 1f32, (g, s), inputs.device())?;
            let p = (&gate_2_norm / opts.second_expert_threshold.max(1e-9))?;
            Some(u.lt(&p)?.to_dtype(DType::F32)?)
        }
        SecondExpertPolicy::Random => None,
        _ if opts.second_expert_threshold > 0.0 => Some(
            gate_2_norm
                .gt(opts.second_expert_threshold)?
                .to_dtype(DType::F32)?,
        ),
        _ => None,
    };
    if let Some(keep) = keep_2 {
        gate_2_norm = (gate_2_norm * &keep)?;
        mask_2 = mask_2.broadcast_mul(&keep.unsqueeze(2)?)?;
    }
    gate_2 = gate_2_norm;

    // ── Capacity ────────────────────────────────────────────────────────────
    let position_1 = (exclusive_cumsum(&mask_1, 1)? * &mask_1)?;
    let mask_1 = (&mask_1 * position_1.lt(c as f64)?.to_dtype(DType::F32)?)?;
    let mask_1_count = mask_1.sum_keepdim(1)?;
    let mask_1_flat = mask_1.sum(D::Minus1)?;
    let position_1 = (position_1 * &mask_1)?.sum(D::Minus1)?;
    gate_1 = (gate_1 * &mask_1_flat)?;

    let position_2 = exclusive_cumsum(&mask_2, 1)?.broadcast_add(&mask_1_count)?;
    let position_2 = (position_2 * &mask_2)?;
    let mask_2 = (&mask_2 * position_2.lt(c as f64)?.to_dtype(DType::F32)?)?;
    let mask_2_flat = mask_2.sum(D::Minus1)?;
    let position_2 = (position_2 * &mask_2)?.sum(D::Minus1)?;
    gate_2 = (gate_2 * &mask_2_flat)?;

    if !opts.legacy_mtf_behavior {
        let denom = (&gate_1 + &gate_2)?;
        let safe = denom.gt(0f32)?.where_cond(&denom, &denom.ones_like()?)?;
        gate_1 = gate_1.div(&safe)?;
        gate_2 = gate_2.div(&safe)?;
    }

    // ── Combine / dispatch ──────────────────────────────────────────────────
    let slot = |gate: &Tensor, index: &Tensor, position: &Tensor| -> Result<Tensor> {
        let expert = one_hot(index, e, DType::F32)?.unsqueeze(3)?;
        let capacity_slot = one_hot(position, c, DType::F32)?.unsqueeze(2)?;
        expert
            .broadcast_mul(&capacity_slot)?
            .broadcast_mul(&gate.unsqueeze(2)?.unsqueeze(3)?)
    };
    let combine_tensor = (slot(&gate_1, &index_1, &position_1)?
        + slot(&gate_2, &index_2, &position_2)?)?;
    let dispatch_tensor = combine_tensor.gt(0f32)?.to_dtype(DType::F32)?;

    tracing::trace!(
        groups = g,
        group_size = s,
        experts = e,
        capacity = c,
        "top-2 gating"
    );

    Ok(GatingOutput {
        combine_tensor,
        dispatch_tensor,
        aux_loss,
    })
}
