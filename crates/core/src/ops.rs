//! Tensor helpers composed from candle primitives.
//!
//! Nothing here owns parameters. Layers call these for the small pieces of
//! glue that candle does not ship directly: one-hot encoding, exclusive
//! cumulative sums, padding replacement and softmax with an extra logit.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::Init;

use gshard_common::BuilderConfig;

/// Logit assigned to padded attention positions.
///
/// Large enough that `exp` underflows to zero, small enough that adding a
/// finite logit cannot overflow to `-inf`.
pub const LARGE_NEGATIVE: f32 = -0.7 * f32::MAX;

/// [`LARGE_NEGATIVE`] scaled to the finite range of `dtype`.
pub fn large_negative(dtype: DType) -> f32 {
    match dtype {
        DType::F16 => -0.7 * 65504.0,
        DType::BF16 => -0.7 * 3.389_531_4e38,
        _ => LARGE_NEGATIVE,
    }
}

/// Additive bias the GShard builder uses for positions that are not visible.
pub const NOT_VISIBLE_BIAS: f64 = -1e9;

/// One-hot encode integer ids: `[...]` → `[..., depth]`.
///
/// Ids outside `[0, depth)` produce all-zero rows.
pub fn one_hot(ids: &Tensor, depth: usize, dtype: DType) -> Result<Tensor> {
    let ids = ids.to_dtype(DType::I64)?.unsqueeze(D::Minus1)?;
    let classes = Tensor::arange(0i64, depth as i64, ids.device())?;
    ids.broadcast_eq(&classes)?.to_dtype(dtype)
}

/// Cumulative sum along `dim` that excludes the current element.
pub fn exclusive_cumsum(x: &Tensor, dim: usize) -> Result<Tensor> {
    x.cumsum(dim)? - x
}

/// `x · w` over the last axis of `x`, for a 2-D `w: [in, out]`.
pub fn linear_last(x: &Tensor, w: &Tensor) -> Result<Tensor> {
    let (in_dim, out_dim) = w.dims2()?;
    let dims = x.dims();
    let rank = dims.len();
    if rank == 0 || dims[rank - 1] != in_dim {
        candle_core::bail!("linear_last: input {:?} does not end in {in_dim}", dims);
    }
    let lead: usize = dims[..rank - 1].iter().product();
    let mut out_shape = dims[..rank - 1].to_vec();
    out_shape.push(out_dim);
    x.reshape((lead, in_dim))?.matmul(w)?.reshape(out_shape)
}

/// Replace `x` by `value` wherever `padding > 0.5`; `padding` broadcasts to `x`.
pub fn apply_padding(x: &Tensor, padding: &Tensor, value: f32) -> Result<Tensor> {
    let mask = padding
        .to_dtype(DType::F32)?
        .broadcast_as(x.dims())?
        .gt(0.5)?;
    // Clamp so the fill stays finite in half precision.
    let value = value.max(large_negative(x.dtype()));
    let fill = Tensor::full(value, x.dims(), x.device())?.to_dtype(x.dtype())?;
    mask.where_cond(&fill, x)
}

/// Multiply `x` by the non-padding mask `segment_id != 0`, broadcasting the
/// mask over the trailing dimensions of `x`.
pub fn mask_padding(x: &Tensor, segment_id: &Tensor) -> Result<Tensor> {
    let mut mask = segment_id
        .to_dtype(DType::F32)?
        .ne(0f32)?
        .to_dtype(x.dtype())?;
    while mask.rank() < x.rank() {
        mask = mask.unsqueeze(D::Minus1)?;
    }
    x.broadcast_mul(&mask)
}

/// Log-softmax along the last axis where the normaliser may include an
/// implicit `extra_logit`. The running max is taken without gradient.
pub fn log_softmax_with_extra_logit(x: &Tensor, extra_logit: Option<f64>) -> Result<Tensor> {
    let mut max = x.detach().max_keepdim(D::Minus1)?;
    if let Some(extra) = extra_logit {
        max = max.maximum(extra)?;
    }
    let shifted = x.broadcast_sub(&max)?;
    let mut sum = shifted.exp()?.sum_keepdim(D::Minus1)?;
    if let Some(extra) = extra_logit {
        sum = (sum + max.affine(-1.0, extra)?.exp()?)?;
    }
    shifted.broadcast_sub(&sum.log()?)
}

/// Softmax counterpart of [`log_softmax_with_extra_logit`]. With an extra
/// logit, rows sum to less than one.
pub fn softmax_with_extra_logit(x: &Tensor, extra_logit: Option<f64>) -> Result<Tensor> {
    log_softmax_with_extra_logit(x, extra_logit)?.exp()
}

/// `log Σ exp(x)` over the last axis, keeping the reduced dim.
pub fn logsumexp(x: &Tensor) -> Result<Tensor> {
    let max = x.detach().max_keepdim(D::Minus1)?;
    let sum = x.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
    sum.log()? + max
}

// ── Initialisers ────────────────────────────────────────────────────────────

/// Variance-scaling uniform init, `±sqrt(3 / fan_in)`.
pub fn fan_in_uniform(fan_in: usize) -> Init {
    let scale = (1.0 / fan_in.max(1) as f64).sqrt() * 3f64.sqrt();
    Init::Uniform {
        lo: -scale,
        up: scale,
    }
}

/// Zero-mean Gaussian init.
pub fn gaussian(stdev: f64) -> Init {
    Init::Randn { mean: 0.0, stdev }
}

/// Glorot uniform init, `±sqrt(6 / (fan_in + fan_out))`.
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    Init::Uniform {
        lo: -limit,
        up: limit,
    }
}

// ── Dropout ─────────────────────────────────────────────────────────────────

/// Inverted dropout, active only when `train` is set.
///
/// `broadcast_dims` collapse those noise dimensions to 1 so one draw is
/// shared along them (negative values count from the end).
#[derive(Debug, Clone, Default)]
pub struct Dropout {
    rate: f64,
    broadcast_dims: Vec<isize>,
}

impl Dropout {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            broadcast_dims: Vec::new(),
        }
    }

    pub fn with_broadcast_dims(rate: f64, broadcast_dims: &[isize]) -> Self {
        Self {
            rate,
            broadcast_dims: broadcast_dims.to_vec(),
        }
    }

    /// Dropout at `rate` using the builder's noise-shape broadcast dims.
    pub fn from_builder(rate: f64, config: &BuilderConfig) -> Self {
        Self::with_broadcast_dims(
            rate,
            config.noise_shape_broadcast_dims.as_deref().unwrap_or(&[]),
        )
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.rate <= 0.0 {
            return Ok(x.clone());
        }
        let rank = x.rank() as isize;
        let mut noise_shape = x.dims().to_vec();
        for &d in &self.broadcast_dims {
            let idx = if d < 0 { rank + d } else { d };
            if idx < 0 || idx >= rank {
                candle_core::bail!("dropout broadcast dim {d} out of range for rank {rank}");
            }
            noise_shape[idx as usize] = 1;
        }
        let keep = 1.0 - self.rate;
        let noise = Tensor::rand(0f32, 1f32, noise_shape, x.device())?;
        let mask = (noise.lt(keep)?.to_dtype(x.dtype())? * (1.0 / keep))?;
        x.broadcast_mul(&mask)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
