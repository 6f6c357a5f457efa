//! Generation runtime: load a decoder-only checkpoint and decode tokens.
//!
//! The prompt is prefilled one position at a time through
//! [`MoeTransformer::extend_step`], which fills the per-layer attention
//! caches; every further token costs a single step.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use parking_lot::Mutex;

use gshard_common::ModelConfig;
use gshard_core::{DecodeState, MoeTransformer};

use crate::sampler::{Sampler, SamplerConfig};

/// High-level generation runtime.
pub struct Generator {
    model: MoeTransformer,
    config: ModelConfig,
    tokenizer: Option<tokenizers::Tokenizer>,
    sampler: Mutex<Sampler>,
    /// Cache of the generation in progress.
    state: Mutex<Option<DecodeState>>,
    device: Device,
}

impl Generator {
    /// Load `config.json`, `model.safetensors` and, when present,
    /// `tokenizer.json` from `model_dir`.
    pub fn load(model_dir: &Path, sampler_config: SamplerConfig, device: Device) -> anyhow::Result<Self> {
        let config = ModelConfig::load(&model_dir.join("config.json"))
            .with_context(|| format!("load config from {}", model_dir.display()))?;
        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = if tokenizer_path.exists() {
            let tok = tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
            Some(tok)
        } else {
            None
        };

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MoeTransformer::new(vb, &config)?;
        varmap
            .load(model_dir.join("model.safetensors"))
            .context("load model.safetensors")?;
        tracing::info!(dir = %model_dir.display(), tokenizer = tokenizer.is_some(), "loaded generator");

        Self::from_parts(model, tokenizer, sampler_config, device)
    }

    /// Wrap an already-built model. Its tensors keep the loaded weights alive.
    pub fn from_parts(
        model: MoeTransformer,
        tokenizer: Option<tokenizers::Tokenizer>,
        sampler_config: SamplerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        let config = model.config().clone();
        anyhow::ensure!(
            config.is_decoder_only(),
            "generation needs a decoder-only model"
        );
        Ok(Self {
            model,
            config,
            tokenizer,
            sampler: Mutex::new(Sampler::new(sampler_config)),
            state: Mutex::new(None),
            device,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn step(&self, state: &mut DecodeState, token: u32) -> anyhow::Result<Tensor> {
        let ids = Tensor::new(&[token], &self.device)?;
        Ok(self.model.extend_step(state, &ids)?.squeeze(0)?)
    }

    /// Continue `prompt` with up to `max_tokens` sampled ids. Stops early on
    /// EOS (not included) or when the position embedding is exhausted. An
    /// empty prompt starts from EOS.
    pub fn generate_ids(&self, prompt: &[u32], max_tokens: usize) -> anyhow::Result<Vec<u32>> {
        let eos = self.config.eos_id;
        let max_len = self.config.max_len;
        let mut prompt = if prompt.is_empty() { vec![eos] } else { prompt.to_vec() };
        if prompt.len() >= max_len {
            let drop = prompt.len() + 1 - max_len;
            tracing::debug!(dropped = drop, "truncating prompt to fit max_len");
            prompt.drain(..drop);
        }

        let mut guard = self.state.lock();
        let state = guard.insert(self.model.init_decode_state(None)?);
        let mut sampler = self.sampler.lock();

        let mut logits = None;
        for &token in &prompt {
            logits = Some(self.step(state, token)?);
        }
        let mut out = Vec::with_capacity(max_tokens);
        while let Some(l) = logits.take() {
            if out.len() >= max_tokens {
                break;
            }
            let next = sampler.sample(&l)?;
            if next == eos {
                break;
            }
            out.push(next);
            if state.time_step() < max_len && out.len() < max_tokens {
                logits = Some(self.step(state, next)?);
            }
        }
        tracing::debug!(prompt = prompt.len(), generated = out.len(), "generation done");
        Ok(out)
    }

    /// Tokenise `prompt`, generate, and decode prompt plus continuation.
    pub fn generate(&self, prompt: &str, max_tokens: usize) -> anyhow::Result<String> {
        let tokenizer = self
            .tokenizer
            .as_ref()
            .context("no tokenizer.json next to the checkpoint")?;
        let enc = tokenizer
            .encode(prompt, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        let mut tokens = enc.get_ids().to_vec();
        let generated = self.generate_ids(&tokens, max_tokens)?;
        tokens.extend(generated);
        tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }

    /// Number of positions the last generation consumed.
    pub fn last_length(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.time_step())
    }

    /// Interactive loop (returns on empty input).
    pub fn chat_loop(&self, max_tokens: usize) -> anyhow::Result<()> {
        use std::io::{self, Write};
        loop {
            print!("> ");
            io::stdout().flush()?;
            let mut input = String::new();
            io::stdin().read_line(&mut input)?;
            let input = input.trim();
            if input.is_empty() || input == "quit" || input == "exit" {
                break;
            }
            println!("{}", self.generate(input, max_tokens)?);
        }
        Ok(())
    }
}
