//! Data pipeline: pre-tokenised token files and sequence packing.
//!
//! Token files hold one flat stream of ids in which documents are separated by
//! an EOS id. Training rows are built by *packing*: several documents share a
//! row and are told apart by `segment_id` (1, 2, ...; 0 marks padding) while
//! `segment_pos` restarts at 0 for each document:
//!
//! ```text
//! ids         [ 4,  3, 24,  0]
//! segment_id  [ 1,  1,  2,  0]
//! segment_pos [ 0,  1,  0,  0]
//! ```
//!
//! * **[`MmapDataset`]** — zero-copy access to a `TKN2` file via `memmap2`.
//! * **[`SequencePacker`]** — turns a token stream into [`PackedBatch`]es.
//! * **[`BatchDataset`]** — common interface over token sources.
//! * **[`tokenize_documents`]** — text or JSONL lines → EOS-separated ids.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use tokenizers::Tokenizer;

// ── Tokenized binary format ──────────────────────────────────────────────────

/// Magic bytes for the tokenized binary format (version 2).
const TOKENIZED_MAGIC: &[u8; 4] = b"TKN2";
/// Header size: magic (4) + num_tokens (8).
const TOKENIZED_HEADER_LEN: usize = 4 + 8;

/// Write a token stream to a binary file for use with [`MmapDataset`].
///
/// Format: magic "TKN2" (4 bytes), `num_tokens` as u64 LE (8 bytes), then
/// `num_tokens` × u32 LE.
pub fn write_tokenized_file(path: &Path, token_ids: &[u32]) -> AnyhowResult<()> {
    let mut f = File::create(path).context("create tokenized file")?;
    f.write_all(TOKENIZED_MAGIC)?;
    f.write_all(&(token_ids.len() as u64).to_le_bytes())?;
    for &id in token_ids {
        f.write_all(&id.to_le_bytes())?;
    }
    f.sync_all().context("sync tokenized file")?;
    Ok(())
}

// ── MmapDataset ─────────────────────────────────────────────────────────────

/// Memory-mapped `TKN2` token file.
pub struct MmapDataset {
    mmap: Mmap,
    num_tokens: usize,
}

impl MmapDataset {
    pub fn open(path: &Path) -> AnyhowResult<Self> {
        let file = File::open(path)
            .with_context(|| format!("open tokenized file {}", path.display()))?;
        // SAFETY: the file is opened read-only and not modified while mapped.
        let mmap = unsafe { Mmap::map(&file).context("mmap tokenized file")? };
        anyhow::ensure!(
            mmap.len() >= TOKENIZED_HEADER_LEN && &mmap[..4] == TOKENIZED_MAGIC,
            "{} is not a TKN2 token file",
            path.display()
        );
        let mut count = [0u8; 8];
        count.copy_from_slice(&mmap[4..TOKENIZED_HEADER_LEN]);
        let num_tokens = usize::try_from(u64::from_le_bytes(count))
            .context("token count does not fit in memory")?;
        let expected = num_tokens
            .checked_mul(4)
            .and_then(|n| n.checked_add(TOKENIZED_HEADER_LEN))
            .with_context(|| format!("token count {num_tokens} overflows the file size"))?;
        anyhow::ensure!(
            mmap.len() >= expected,
            "truncated token file: header says {num_tokens} tokens, file has {} bytes",
            mmap.len()
        );
        tracing::debug!(path = %path.display(), num_tokens, "opened token file");
        Ok(Self { mmap, num_tokens })
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Iterate over all token ids in file order.
    pub fn tokens(&self) -> impl Iterator<Item = u32> + '_ {
        let end = TOKENIZED_HEADER_LEN + self.num_tokens * 4;
        self.mmap[TOKENIZED_HEADER_LEN..end]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }
}

// ── Packed batches ──────────────────────────────────────────────────────────

/// One packed batch, row-major `(batch_size, seq_len)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBatch {
    pub batch_size: usize,
    pub seq_len: usize,
    pub ids: Vec<u32>,
    /// Next-token targets; each segment is shifted independently.
    pub labels: Vec<u32>,
    pub segment_ids: Vec<u32>,
    pub segment_pos: Vec<u32>,
}

/// Tensor view of a [`PackedBatch`]; every tensor is `u32 (batch, seq_len)`.
#[derive(Debug, Clone)]
pub struct PackedTensors {
    pub ids: Tensor,
    pub labels: Tensor,
    pub segment_ids: Tensor,
    pub segment_pos: Tensor,
}

impl PackedBatch {
    fn empty(batch_size: usize, seq_len: usize) -> Self {
        let n = batch_size * seq_len;
        Self {
            batch_size,
            seq_len,
            ids: vec![0; n],
            labels: vec![0; n],
            segment_ids: vec![0; n],
            segment_pos: vec![0; n],
        }
    }

    /// Number of non-padding positions.
    pub fn num_real_tokens(&self) -> usize {
        self.segment_ids.iter().filter(|&&s| s != 0).count()
    }

    pub fn to_tensors(&self, device: &Device) -> Result<PackedTensors> {
        let shape = (self.batch_size, self.seq_len);
        Ok(PackedTensors {
            ids: Tensor::from_vec(self.ids.clone(), shape, device)?,
            labels: Tensor::from_vec(self.labels.clone(), shape, device)?,
            segment_ids: Tensor::from_vec(self.segment_ids.clone(), shape, device)?,
            segment_pos: Tensor::from_vec(self.segment_pos.clone(), shape, device)?,
        })
    }
}

// ── SequencePacker ──────────────────────────────────────────────────────────

/// Greedy packer over an EOS-separated token stream.
///
/// A document of `n + 1` tokens (EOS included) occupies `n` positions: inputs
/// are its first `n` tokens and labels its last `n`. A document that does not
/// fit the remaining space of a non-empty row starts a new row; a document
/// longer than a whole row is split across rows.
pub struct SequencePacker<I: Iterator<Item = u32>> {
    tokens: I,
    eos_id: u32,
    batch_size: usize,
    seq_len: usize,
    pending: Vec<u32>,
    exhausted: bool,
}

impl<I: Iterator<Item = u32>> SequencePacker<I> {
    pub fn new(tokens: I, eos_id: u32, batch_size: usize, seq_len: usize) -> Self {
        Self {
            tokens,
            eos_id,
            batch_size,
            seq_len,
            pending: Vec::new(),
            exhausted: false,
        }
    }

    /// Next document (or remainder of a split one) with at least two tokens.
    fn next_document(&mut self) -> Option<Vec<u32>> {
        if self.pending.len() >= 2 {
            return Some(std::mem::take(&mut self.pending));
        }
        self.pending.clear();
        while !self.exhausted {
            let mut doc = Vec::new();
            loop {
                match self.tokens.next() {
                    Some(t) => {
                        doc.push(t);
                        if t == self.eos_id {
                            break;
                        }
                    }
                    None => {
                        self.exhausted = true;
                        break;
                    }
                }
            }
            if doc.len() >= 2 {
                return Some(doc);
            }
        }
        None
    }

    /// Fill row `row` of `batch`; returns false when no token was placed.
    fn fill_row(&mut self, batch: &mut PackedBatch, row: usize) -> bool {
        let base = row * self.seq_len;
        let mut used = 0usize;
        let mut segment = 0u32;
        while used < self.seq_len {
            let Some(doc) = self.next_document() else {
                break;
            };
            let needed = doc.len() - 1;
            let space = self.seq_len - used;
            if needed > space && used > 0 {
                self.pending = doc;
                break;
            }
            let take = needed.min(space);
            segment += 1;
            for i in 0..take {
                let p = base + used + i;
                batch.ids[p] = doc[i];
                batch.labels[p] = doc[i + 1];
                batch.segment_ids[p] = segment;
                batch.segment_pos[p] = i as u32;
            }
            used += take;
            if take < needed {
                self.pending = doc[take..].to_vec();
            }
        }
        used > 0
    }
}

impl<I: Iterator<Item = u32>> Iterator for SequencePacker<I> {
    type Item = PackedBatch;

    fn next(&mut self) -> Option<PackedBatch> {
        let mut batch = PackedBatch::empty(self.batch_size, self.seq_len);
        let mut rows = 0usize;
        for row in 0..self.batch_size {
            if !self.fill_row(&mut batch, row) {
                break;
            }
            rows += 1;
        }
        // A partial final batch is kept; its trailing rows are all padding.
        (rows > 0).then_some(batch)
    }
}

// ── Text corpora ────────────────────────────────────────────────────────────

/// Tokenise a text file, or every `.txt`/`.jsonl` file of a directory, into
/// one EOS-separated stream. Each non-empty line is a document; JSONL lines
/// contribute their `text` field (or `input` and `output` joined).
pub fn tokenize_documents(path: &Path, tokenizer_path: &Path, eos_id: u32) -> AnyhowResult<Vec<u32>> {
    let tokenizer = Tokenizer::from_file(tokenizer_path.as_os_str().to_string_lossy().to_string())
        .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let p = entry?.path();
            let text_like = p
                .extension()
                .is_some_and(|ext| ext == "txt" || ext == "jsonl");
            if p.is_file() && text_like {
                files.push(p);
            }
        }
        files.sort();
        files
    } else {
        anyhow::bail!("path is neither file nor directory: {}", path.display());
    };

    let mut ids = Vec::new();
    let mut documents = 0usize;
    for file in &files {
        let reader = BufReader::new(File::open(file).with_context(|| format!("open {}", file.display()))?);
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let enc = tokenizer
                .encode(extract_text(line).as_str(), false)
                .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
            ids.extend(enc.get_ids());
            ids.push(eos_id);
            documents += 1;
        }
    }
    tracing::info!(files = files.len(), documents, tokens = ids.len(), "tokenised corpus");
    Ok(ids)
}

fn extract_text(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                return t.to_string();
            }
            if let (Some(inp), Some(out)) = (
                v.get("input").and_then(|x| x.as_str()),
                v.get("output").and_then(|x| x.as_str()),
            ) {
                return format!("{inp}\n{out}");
            }
        }
    }
    line.to_string()
}

// ── BatchDataset trait ──────────────────────────────────────────────────────

/// Common interface for token sources that yield packed batches.
pub trait BatchDataset {
    fn num_tokens(&self) -> usize;
    fn batches(
        &self,
        eos_id: u32,
        batch_size: usize,
        seq_len: usize,
    ) -> Box<dyn Iterator<Item = PackedBatch> + '_>;
}

impl BatchDataset for MmapDataset {
    fn num_tokens(&self) -> usize {
        self.num_tokens()
    }
    fn batches(
        &self,
        eos_id: u32,
        batch_size: usize,
        seq_len: usize,
    ) -> Box<dyn Iterator<Item = PackedBatch> + '_> {
        Box::new(SequencePacker::new(self.tokens(), eos_id, batch_size, seq_len))
    }
}

impl BatchDataset for Vec<u32> {
    fn num_tokens(&self) -> usize {
        self.len()
    }
    fn batches(
        &self,
        eos_id: u32,
        batch_size: usize,
        seq_len: usize,
    ) -> Box<dyn Iterator<Item = PackedBatch> + '_> {
        Box::new(SequencePacker::new(self.iter().copied(), eos_id, batch_size, seq_len))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
