//! Sharding annotations.
//!
//! Model code marks tensors as split across a one-dimensional device mesh the
//! same way a sharded SPMD program would. candle executes on a single device,
//! so an annotation never moves data: it validates the request, records it in
//! the mesh's [`ShardingLog`] and hands the tensor back unchanged. Parameters
//! whose leading dimension is partitioned (expert weights) are held as
//! [`ShardedVar`]s, which can materialise their per-device slices.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{Result, Shape, Tensor};
use candle_nn::{Init, VarBuilder};
use parking_lot::Mutex;

/// How a tensor is laid out over the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardingSpec {
    Replicated,
    Split { dim: usize, num_devices: usize },
}

/// One recorded annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub shape: Vec<usize>,
    pub spec: ShardingSpec,
    /// `shape[dim]` is not a multiple of `num_devices`; shards are padded.
    pub uneven: bool,
}

/// Latest annotation per scoped name. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ShardingLog {
    entries: Arc<Mutex<BTreeMap<String, Annotation>>>,
}

impl ShardingLog {
    pub fn record(&self, name: &str, annotation: Annotation) {
        self.entries.lock().insert(name.to_string(), annotation);
    }

    pub fn get(&self, name: &str) -> Option<Annotation> {
        self.entries.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names recorded so far, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Annotate `x` as split along `dim` over `num_devices` devices.
///
/// Identity for `num_devices <= 1`. Fails when `dim` is out of range.
pub fn split(x: &Tensor, dim: usize, num_devices: usize) -> Result<(Tensor, ShardingSpec)> {
    if num_devices <= 1 {
        return Ok((x.clone(), ShardingSpec::Replicated));
    }
    if dim >= x.rank() {
        candle_core::bail!(
            "cannot split dim {dim} of a rank-{} tensor {:?}",
            x.rank(),
            x.dims()
        );
    }
    Ok((x.clone(), ShardingSpec::Split { dim, num_devices }))
}

/// A one-dimensional device mesh plus the log of annotations made against it.
#[derive(Debug, Clone)]
pub struct Mesh {
    num_devices: usize,
    log: ShardingLog,
}

impl Mesh {
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices: num_devices.max(1),
            log: ShardingLog::default(),
        }
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    pub fn log(&self) -> &ShardingLog {
        &self.log
    }

    /// Split `x` along dim 0 and record the annotation under `name`.
    pub fn split(&self, name: &str, x: &Tensor) -> Result<Tensor> {
        self.split_dim(name, x, 0)
    }

    pub fn split_dim(&self, name: &str, x: &Tensor, dim: usize) -> Result<Tensor> {
        let (y, spec) = split(x, dim, self.num_devices)?;
        let uneven = match spec {
            ShardingSpec::Split { dim, num_devices } => x.dim(dim)? % num_devices != 0,
            ShardingSpec::Replicated => false,
        };
        if uneven {
            tracing::debug!(name, shape = ?x.dims(), dim, "uneven split; shards are padded");
        } else {
            tracing::trace!(name, shape = ?x.dims(), ?spec, "sharding annotation");
        }
        self.log.record(
            name,
            Annotation {
                shape: x.dims().to_vec(),
                spec,
                uneven,
            },
        );
        Ok(y)
    }
}

// ── ShardedVar ──────────────────────────────────────────────────────────────

/// A parameter whose leading dimension is partitioned across the mesh.
#[derive(Debug, Clone)]
pub struct ShardedVar {
    tensor: Tensor,
    num_devices: usize,
}

impl ShardedVar {
    pub fn new<S: Into<Shape>>(
        vb: &VarBuilder,
        name: &str,
        shape: S,
        init: Init,
        num_devices: usize,
    ) -> Result<Self> {
        let shape: Shape = shape.into();
        let num_devices = num_devices.max(1);
        let lead = shape.dims().first().copied().unwrap_or(0);
        if lead == 0 || lead % num_devices != 0 {
            candle_core::bail!(
                "sharded var {name}: leading dim {lead} is not divisible by {num_devices} devices"
            );
        }
        let tensor = vb.get_with_hints(shape, name, init)?;
        Ok(Self {
            tensor,
            num_devices,
        })
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Shape of the slice each device holds.
    pub fn shard_shape(&self) -> Vec<usize> {
        let mut dims = self.tensor.dims().to_vec();
        dims[0] /= self.num_devices;
        dims
    }

    /// Per-device slices along the leading dimension.
    pub fn shards(&self) -> Result<Vec<Tensor>> {
        let per_device = self.tensor.dim(0)? / self.num_devices;
        (0..self.num_devices)
            .map(|d| self.tensor.narrow(0, d * per_device, per_device))
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
