use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use gshard_common::{
    tokenize_documents, write_tokenized_file, BatchDataset, MmapDataset, ModelConfig, PackedBatch,
    StackConfig, SubLayerKind,
};
use gshard_core::param_stats;
use gshard_infer::{Generator, SamplerConfig};
use gshard_train::{LrDecay, Trainer, TrainerConfig};

/// Number of packed batches the producer thread keeps ready.
const PREFETCH_BUFFER: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "gshard", about = "Train and decode sharded Mixture-of-Experts transformers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default model config.
    InitConfig(InitConfigArgs),
    /// Tokenise text (or read a JSON id list) into a TKN2 token file.
    Pack(PackArgs),
    /// Train a model on a TKN2 token file.
    Train(TrainArgs),
    /// Print parameter counts for a model config.
    Stats(StatsArgs),
    /// Generate from a trained decoder-only model directory.
    Generate(GenerateArgs),
}

// ── Init-config / Stats ─────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
    /// Add an encoder stack (self-attention + MoE) and cross-attention.
    #[arg(long)]
    encoder_decoder: bool,
    #[arg(long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct StatsArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

// ── Pack ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct PackArgs {
    /// Text file, directory of .txt/.jsonl files, or a .json array of ids.
    #[arg(long)]
    input: PathBuf,
    /// Required for text input.
    #[arg(long)]
    tokenizer: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    eos_id: u32,
    #[arg(long)]
    output: PathBuf,
}

// ── Train ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// TKN2 token file.
    #[arg(long)]
    data: PathBuf,
    #[arg(long)]
    val_data: Option<PathBuf>,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    /// Defaults to the model's max_len.
    #[arg(long)]
    seq_len: Option<usize>,
    #[arg(long, default_value_t = 10_000)]
    max_steps: usize,
    /// 0 repeats the data until max_steps.
    #[arg(long, default_value_t = 0)]
    max_epochs: usize,
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    #[arg(long, default_value_t = 1e-5)]
    lr_min: f64,
    #[arg(long, default_value_t = 1000)]
    lr_warmup_steps: usize,
    #[arg(long, default_value = "rsqrt", value_parser = ["cosine", "linear", "rsqrt", "constant", "none"])]
    lr_decay: String,
    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,
    #[arg(long, default_value_t = 1.0)]
    grad_clip_max_norm: f64,
    #[arg(long, default_value_t = 1000)]
    save_every: usize,
    #[arg(long, default_value_t = 10)]
    log_every: usize,
    #[arg(long, default_value_t = 500)]
    eval_every: usize,
    #[arg(long, default_value_t = 20)]
    eval_batches: usize,
    /// Safetensors checkpoint to continue from.
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long, default_value_t = 0)]
    resume_step: usize,
}

// ── Generate ────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct GenerateArgs {
    #[arg(long)]
    model_dir: PathBuf,
    /// Text prompt (needs tokenizer.json in the model dir).
    #[arg(long, conflicts_with = "ids")]
    prompt: Option<String>,
    /// Comma-separated prompt ids.
    #[arg(long, value_delimiter = ',')]
    ids: Option<Vec<u32>>,
    /// Read prompts from stdin until an empty line.
    #[arg(long)]
    interactive: bool,
    #[arg(long, default_value_t = 64)]
    max_tokens: usize,
    #[arg(long, default_value_t = 0.8)]
    temperature: f64,
    #[arg(long, default_value_t = 40)]
    top_k: usize,
    #[arg(long, default_value_t = 1.0)]
    top_p: f64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(args),
        Command::Pack(args) => cmd_pack(args),
        Command::Train(args) => cmd_train(args),
        Command::Stats(args) => cmd_stats(args),
        Command::Generate(args) => cmd_generate(args),
    }
}

// ── Command implementations ─────────────────────────────────────────────────

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!("{} exists; pass --force to overwrite", args.output.display());
    }
    let mut config = ModelConfig::default();
    if args.encoder_decoder {
        config.encoder = Some(StackConfig {
            sub_layers: vec![SubLayerKind::SelfAttention, SubLayerKind::Moe],
            num_layers: config.decoder.num_layers,
        });
        config.decoder.sub_layers = vec![
            SubLayerKind::DecSelfAttention,
            SubLayerKind::DecEncAttention,
            SubLayerKind::Moe,
        ];
    }
    config.validate()?;
    config.save(&args.output)?;
    eprintln!("Wrote default config to {}", args.output.display());
    Ok(())
}

fn cmd_stats(args: StatsArgs) -> Result<()> {
    let config = ModelConfig::load(&args.config)
        .with_context(|| format!("load {}", args.config.display()))?;
    config.validate()?;
    let stats = param_stats(&config);
    println!("total params:            {}", stats.total_params);
    println!("  embedding:             {}", stats.embedding_params);
    println!("  dense:                 {}", stats.dense_params);
    println!("  experts:               {}", stats.expert_params);
    println!("  experts per device:    {}", stats.expert_params_per_device);
    println!("moe layers:              {}", stats.num_moe_layers);
    Ok(())
}

fn cmd_pack(args: PackArgs) -> Result<()> {
    let tokens: Vec<u32> = if args.input.extension().is_some_and(|e| e == "json") {
        let json = std::fs::read_to_string(&args.input)?;
        serde_json::from_str(&json).context("expected a JSON array of token ids")?
    } else {
        let tokenizer = args
            .tokenizer
            .as_deref()
            .context("--tokenizer is required for text input")?;
        tokenize_documents(&args.input, tokenizer, args.eos_id)?
    };
    let docs = tokens.iter().filter(|&&t| t == args.eos_id).count();
    write_tokenized_file(&args.output, &tokens)?;
    eprintln!(
        "Wrote {} tokens ({} documents) to {}",
        tokens.len(),
        docs,
        args.output.display()
    );
    Ok(())
}

enum PrefetchMessage {
    Batch(PackedBatch),
    EpochEnd,
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let model_config = if args.config.exists() {
        ModelConfig::load(&args.config)?
    } else {
        let default = ModelConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    let seq_len = args.seq_len.unwrap_or(model_config.max_len);
    let eos_id = model_config.eos_id;

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        seq_len,
        max_steps: args.max_steps,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_decay: args.lr_decay.parse::<LrDecay>()?,
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        save_every: args.save_every,
        log_every: args.log_every,
        eval_every: args.eval_every,
        eval_batches: args.eval_batches,
        output_dir: args.output_dir.clone(),
    };

    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(model_config, trainer_config, device)?;
    if let Some(ref ckpt) = args.resume {
        trainer.resume(ckpt, args.resume_step)?;
    }

    let dataset = MmapDataset::open(&args.data)?;
    if dataset.num_tokens() == 0 {
        anyhow::bail!("{} holds no tokens", args.data.display());
    }
    eprintln!("Loaded {} tokens (zero-copy)", dataset.num_tokens());

    let val_dataset = match args.val_data {
        Some(ref p) => {
            let ds = MmapDataset::open(p)?;
            eprintln!("Validation: {} tokens", ds.num_tokens());
            Some(ds)
        }
        None => None,
    };

    std::fs::create_dir_all(&args.output_dir)?;
    let mut metrics_file = match val_dataset {
        Some(_) => {
            let mut f = std::fs::File::create(args.output_dir.join("metrics.csv"))?;
            writeln!(f, "step,val_loss,perplexity")?;
            Some(f)
        }
        None => None,
    };

    // Producer thread owns the dataset and packs batches ahead of the trainer.
    let max_epochs = if args.max_epochs == 0 { usize::MAX } else { args.max_epochs };
    let (tx, rx) = mpsc::sync_channel::<PrefetchMessage>(PREFETCH_BUFFER);
    let batch_size = args.batch_size;
    let producer = thread::spawn(move || {
        for _ in 0..max_epochs {
            for batch in dataset.batches(eos_id, batch_size, seq_len) {
                if tx.send(PrefetchMessage::Batch(batch)).is_err() {
                    return;
                }
            }
            if tx.send(PrefetchMessage::EpochEnd).is_err() {
                return;
            }
        }
    });

    let progress = ProgressBar::new(args.max_steps as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress.set_position(trainer.global_step as u64);

    let mut epoch = 0usize;
    while let Ok(msg) = rx.recv() {
        if trainer.global_step >= args.max_steps {
            break;
        }
        match msg {
            PrefetchMessage::Batch(batch) => {
                let m = trainer.step(&batch)?;
                progress.inc(1);
                progress.set_message(format!("loss {:.4} lr {:.2e}", m.loss, m.lr));
                if args.log_every > 0 && m.step % args.log_every == 0 {
                    tracing::info!(
                        step = m.step,
                        epoch,
                        loss = m.loss,
                        xent = m.xent,
                        aux_loss = m.aux_loss,
                        z_loss = m.z_loss,
                        grad_norm = m.grad_norm,
                        lr = m.lr,
                        tokens = m.tokens,
                        "train step"
                    );
                }
                run_eval_and_checkpoint(&trainer, val_dataset.as_ref(), &mut metrics_file, &args)?;
            }
            PrefetchMessage::EpochEnd => {
                epoch += 1;
                tracing::info!(epoch, step = trainer.global_step, "epoch done");
            }
        }
    }
    drop(rx);
    if producer.join().is_err() {
        tracing::warn!("batch producer thread panicked");
    }
    progress.finish();

    let path = trainer.save_final()?;
    eprintln!("Saved final model to {}", path.display());
    Ok(())
}

fn run_eval_and_checkpoint(
    trainer: &Trainer,
    val_dataset: Option<&MmapDataset>,
    metrics_file: &mut Option<std::fs::File>,
    args: &TrainArgs,
) -> Result<()> {
    let step = trainer.global_step;

    if let Some(val_ds) = val_dataset {
        if args.eval_every > 0 && step % args.eval_every == 0 {
            let (val_loss, ppl) = trainer.evaluate(val_ds)?;
            tracing::info!(step, val_loss, perplexity = ppl, "eval");
            if let Some(ref mut f) = metrics_file {
                writeln!(f, "{step},{val_loss},{ppl}")?;
            }
        }
    }

    if args.save_every > 0 && step % args.save_every == 0 {
        let path = trainer.save_checkpoint()?;
        tracing::info!(path = %path.display(), "saved checkpoint");
    }
    Ok(())
}

fn cmd_generate(args: GenerateArgs) -> Result<()> {
    let sampler = SamplerConfig {
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        seed: args.seed,
    };
    let generator = load_generator(&args.model_dir, sampler)?;

    if args.interactive {
        return generator.chat_loop(args.max_tokens);
    }
    if let Some(ids) = args.ids {
        let out = generator.generate_ids(&ids, args.max_tokens)?;
        let joined: Vec<String> = out.iter().map(|t| t.to_string()).collect();
        println!("{}", joined.join(","));
        return Ok(());
    }
    let prompt = args.prompt.unwrap_or_default();
    println!("{}", generator.generate(&prompt, args.max_tokens)?);
    Ok(())
}

fn load_generator(model_dir: &Path, sampler: SamplerConfig) -> Result<Generator> {
    let device = Device::cuda_if_available(0)?;
    Generator::load(model_dir, sampler, device)
        .with_context(|| format!("load model from {}", model_dir.display()))
}
