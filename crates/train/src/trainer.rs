//! Trainer: encapsulates the full training loop.
//!
//! Decouples the compute graph (forward + objective) from the optimisation
//! step (backward, gradient clipping, AdamW, schedule advance). The objective
//! is the model's mean per-example loss plus the weighted MoE load-balancing
//! loss and the softmax z-loss.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use gshard_common::{BatchDataset, ModelConfig, PackedBatch};
use gshard_core::MoeTransformer;

use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub seq_len: usize,
    pub max_steps: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    pub grad_clip_max_norm: f64,
    pub save_every: usize,
    pub log_every: usize,
    pub eval_every: usize,
    pub eval_batches: usize,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            seq_len: 256,
            max_steps: 10_000,
            lr: 1e-3,
            lr_min: 1e-5,
            lr_warmup_steps: 1_000,
            lr_decay: LrDecay::Rsqrt,
            weight_decay: 0.0,
            grad_clip_max_norm: 1.0,
            save_every: 1_000,
            log_every: 10,
            eval_every: 0,
            eval_batches: 20,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    /// Full objective.
    pub loss: f32,
    /// Mean per-example cross-entropy.
    pub xent: f32,
    pub aux_loss: f32,
    pub z_loss: f32,
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub tokens: usize,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser and learning-rate schedule.
pub struct Trainer {
    pub model: MoeTransformer,
    pub varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    pub config: TrainerConfig,
    model_config: ModelConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Construct a new Trainer. Builds the model from config.
    pub fn new(model_config: ModelConfig, trainer_config: TrainerConfig, device: Device) -> anyhow::Result<Self> {
        anyhow::ensure!(
            trainer_config.seq_len <= model_config.max_len,
            "seq_len {} exceeds the model's max_len {}",
            trainer_config.seq_len,
            model_config.max_len
        );
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MoeTransformer::new(vb, &model_config)?;
        let vars = varmap.all_vars();
        tracing::info!(
            vars = vars.len(),
            batch_size = trainer_config.batch_size,
            seq_len = trainer_config.seq_len,
            "trainer ready"
        );

        let lr_scheduler = LrScheduler::new(
            trainer_config.lr,
            trainer_config.lr_min,
            trainer_config.lr_warmup_steps,
            trainer_config.max_steps,
            trainer_config.lr_decay,
        );
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: trainer_config.lr,
                weight_decay: trainer_config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            config: trainer_config,
            model_config,
            global_step: 0,
            device,
        })
    }

    /// Load weights from a safetensors checkpoint into the current model.
    pub fn resume(&mut self, checkpoint: &Path, step: usize) -> anyhow::Result<()> {
        self.varmap
            .load(checkpoint)
            .with_context(|| format!("load checkpoint {}", checkpoint.display()))?;
        self.global_step = step;
        for _ in 0..step {
            self.lr_scheduler.advance();
        }
        tracing::info!(path = %checkpoint.display(), step, "resumed from checkpoint");
        Ok(())
    }

    /// One optimiser step over one packed batch.
    pub fn step(&mut self, batch: &PackedBatch) -> anyhow::Result<StepMetrics> {
        let tensors = batch.to_tensors(&self.device)?;
        let output = self.model.forward_t(&tensors, None, true)?;
        let objective = self.model.objective(&output)?;

        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let mut grads = objective.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?;
        self.optimizer.step(&grads)?;

        self.lr_scheduler.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: objective.to_scalar::<f32>()?,
            xent: output.per_example_loss.mean_all()?.to_scalar::<f32>()?,
            aux_loss: output.aux_loss.to_scalar::<f32>()?,
            z_loss: output.z_loss.to_scalar::<f32>()?,
            lr,
            grad_norm,
            tokens: batch.num_real_tokens(),
        })
    }

    fn save_to(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join(file_name);
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Save checkpoint.
    pub fn save_checkpoint(&self) -> anyhow::Result<PathBuf> {
        self.save_to(&format!("checkpoint-{}.safetensors", self.global_step))
    }

    /// Save final model.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        self.save_to("model.safetensors")
    }

    /// Token-level validation loss and perplexity over up to `eval_batches`
    /// packed batches.
    pub fn evaluate(&self, val_ds: &dyn BatchDataset) -> anyhow::Result<(f64, f64)> {
        let mut loss_sum = 0.0f64;
        let mut tokens = 0usize;
        let batches = val_ds
            .batches(self.model_config.eos_id, self.config.batch_size, self.config.seq_len)
            .take(self.config.eval_batches);
        for batch in batches {
            let tensors = batch.to_tensors(&self.device)?;
            let output = self.model.forward_t(&tensors, None, false)?;
            loss_sum += output.per_token_loss.sum_all()?.to_scalar::<f32>()? as f64;
            tokens += batch.num_real_tokens();
        }
        if tokens == 0 {
            return Ok((f64::MAX, f64::MAX));
        }
        let avg_loss = loss_sum / tokens as f64;
        Ok((avg_loss, avg_loss.exp()))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Scale gradients so their global L2 norm is at most `max_norm` (no-op when
/// `max_norm <= 0`). Returns the norm before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    if max_norm <= 0.0 || norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), (g * scale)?);
        }
    }
    Ok(norm)
}

/// Sum of squared gradient entries, for tests and diagnostics.
#[cfg(test)]
fn grad_sq_sum(grads: &GradStore, vars: &[Var]) -> f64 {
    vars.iter()
        .filter_map(|v| grads.get(v.as_tensor()))
        .map(|g| g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() as f64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use gshard_common::{BuilderConfig, StackConfig, SubLayerKind};

    fn tiny_model() -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            max_len: 8,
            builder: BuilderConfig {
                model_dim: 8,
                attention_num_heads: 2,
                attention_key_value_dim: 4,
                ff_dim: 8,
                e_dim: 2,
                moe_hidden_dim: 8,
                ..Default::default()
            },
            decoder: StackConfig {
                sub_layers: vec![SubLayerKind::DecSelfAttention, SubLayerKind::Moe],
                num_layers: 1,
            },
            eos_id: 1,
            ..Default::default()
        }
    }

    fn trainer(dir: &Path) -> Trainer {
        let config = TrainerConfig {
            batch_size: 2,
            seq_len: 8,
            max_steps: 10,
            lr_warmup_steps: 2,
            lr_decay: LrDecay::Cosine,
            eval_batches: 4,
            output_dir: dir.to_path_buf(),
            ..Default::default()
        };
        Trainer::new(tiny_model(), config, Device::Cpu).unwrap()
    }

    fn corpus() -> Vec<u32> {
        (0..40u32).map(|i| if i % 5 == 4 { 1 } else { 2 + i % 13 }).collect()
    }

    #[test]
    fn step_reports_finite_metrics_and_advances() {
        let dir = std::env::temp_dir().join(format!("gshard-train-step-{}", std::process::id()));
        let mut trainer = trainer(&dir);
        let data = corpus();
        let batch = data.batches(1, 2, 8).next().unwrap();
        let m = trainer.step(&batch).unwrap();
        assert_eq!(m.step, 0);
        assert_eq!(trainer.global_step, 1);
        assert!(m.loss.is_finite() && m.xent > 0.0);
        assert!(m.aux_loss > 0.0);
        assert!(m.grad_norm > 0.0);
        // First warmup step: (0 + 1) / 2 of the peak rate.
        assert!((m.lr - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn evaluate_returns_perplexity() {
        let dir = std::env::temp_dir().join(format!("gshard-train-eval-{}", std::process::id()));
        let trainer = trainer(&dir);
        let (loss, ppl) = trainer.evaluate(&corpus()).unwrap();
        assert!(loss > 0.0);
        assert!((ppl - loss.exp()).abs() < 1e-6 * ppl);
        let (empty_loss, _) = trainer.evaluate(&Vec::<u32>::new()).unwrap();
        assert_eq!(empty_loss, f64::MAX);
    }

    #[test]
    fn checkpoints_round_trip() {
        let dir = std::env::temp_dir().join(format!("gshard-train-ckpt-{}", std::process::id()));
        let mut trainer = trainer(&dir);
        let data = corpus();
        let batch = data.batches(1, 2, 8).next().unwrap();
        trainer.step(&batch).unwrap();
        let path = trainer.save_checkpoint().unwrap();
        assert!(path.ends_with("checkpoint-1.safetensors"));
        assert!(dir.join("config.json").exists());

        let mut fresh = self::trainer(&dir);
        fresh.resume(&path, 1).unwrap();
        assert_eq!(fresh.global_step, 1);
        let tensors = batch.to_tensors(&Device::Cpu).unwrap();
        let a = trainer.model.forward_t(&tensors, None, false).unwrap();
        let b = fresh.model.forward_t(&tensors, None, false).unwrap();
        let diff = (a.logits - b.logits)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn clipping_bounds_global_norm() {
        let var = Var::from_tensor(&Tensor::new(&[3f32, 4.], &Device::Cpu).unwrap()).unwrap();
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap().affine(0.5, 0.0).unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![var];
        // d/dx 0.5·|x|² = x, so the norm is 5.
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
        assert!((grad_sq_sum(&grads, &vars) - 1.0).abs() < 1e-5);
        let norm = clip_grad_norm(&mut grads, &vars, 0.0).unwrap();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
