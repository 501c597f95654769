//! Tokenizer bridge for text-to-token and token-to-text conversion.
//!
//! Wraps the HuggingFace tokenizers library. A checkpoint directory is
//! searched for `tokenizer.json` first and a SentencePiece
//! `tokenizer.model` second. When neither loads,
//! [`TokenizerBridge::load_or_placeholder`] degrades to
//! [`PlaceholderTokenizer`], a word-counting codec that keeps the engine
//! runnable for structural tests but produces no real text.

use super::sentencepiece::{SentencePieceModel, SENTENCEPIECE_FILE};
use crate::error::{PocketError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{debug, warn};

/// File holding the serialized tokenizer.
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Optional file naming the special tokens.
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// BOS spellings: Gemma, Llama-2/Phi-3, Llama-3.
const BOS_CANDIDATES: &[&str] = &["<bos>", "<s>", "<|begin_of_text|>"];
/// EOS spellings: Gemma, Phi-3, Llama-2, Llama-3.
const EOS_CANDIDATES: &[&str] = &["<eos>", "<|endoftext|>", "</s>", "<|end_of_text|>"];
const PAD_CANDIDATES: &[&str] = &["<pad>", "<|pad|>"];
/// End-of-turn markers of chat templates.
const END_OF_TURN_CANDIDATES: &[&str] = &["<|end|>", "<end_of_turn>", "<|eot_id|>"];

/// Tokenizer backed by a `tokenizer.json` or `tokenizer.model`.
#[derive(Clone)]
pub struct Tokenizer {
    /// Underlying HuggingFace tokenizer.
    inner: HfTokenizer,
    /// BOS token ID.
    bos_token_id: Option<u32>,
    /// EOS token ID.
    eos_token_id: Option<u32>,
    /// PAD token ID.
    pad_token_id: Option<u32>,
    /// Chat end-of-turn token ID.
    end_of_turn_id: Option<u32>,
}

impl Tokenizer {
    /// Load a tokenizer from a tokenizer.json file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = HfTokenizer::from_file(path.as_ref()).map_err(|e| {
            PocketError::TokenizerUnavailable(format!(
                "failed to load {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::from_hf(inner))
    }

    /// Load a tokenizer from a SentencePiece `tokenizer.model` file.
    pub fn from_sentencepiece<P: AsRef<Path>>(path: P) -> Result<Self> {
        let model = SentencePieceModel::from_file(path.as_ref())?;
        Ok(Self::from_hf(model.to_tokenizer()?))
    }

    fn from_hf(inner: HfTokenizer) -> Self {
        let find = |candidates: &[&str]| candidates.iter().find_map(|t| inner.token_to_id(t));
        let bos_token_id = find(BOS_CANDIDATES);
        let eos_token_id = find(EOS_CANDIDATES);
        let pad_token_id = find(PAD_CANDIDATES);
        let end_of_turn_id = find(END_OF_TURN_CANDIDATES);

        Self {
            inner,
            bos_token_id,
            eos_token_id,
            pad_token_id,
            end_of_turn_id,
        }
    }

    /// Load a tokenizer from a model directory.
    ///
    /// Tries `tokenizer.json`, then `tokenizer.model`. Special tokens named
    /// in `tokenizer_config.json` take precedence over the built-in spellings.
    pub fn from_dir<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        let dir = model_dir.as_ref();
        let json_path = dir.join(TOKENIZER_FILE);
        let model_path = dir.join(SENTENCEPIECE_FILE);
        let mut failures = Vec::new();

        let mut tokenizer = None;
        if json_path.exists() {
            match Self::from_file(&json_path) {
                Ok(t) => tokenizer = Some(t),
                Err(e) => {
                    warn!(error = %e, "unusable tokenizer.json");
                    failures.push(e.to_string());
                }
            }
        }
        if tokenizer.is_none() && model_path.exists() {
            match Self::from_sentencepiece(&model_path) {
                Ok(t) => {
                    debug!(path = %model_path.display(), "loaded SentencePiece tokenizer");
                    tokenizer = Some(t);
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        let mut tokenizer = tokenizer.ok_or_else(|| {
            PocketError::TokenizerUnavailable(if failures.is_empty() {
                format!(
                    "neither {} nor {} found in {}",
                    TOKENIZER_FILE,
                    SENTENCEPIECE_FILE,
                    dir.display()
                )
            } else {
                failures.join("; ")
            })
        })?;
        tokenizer.apply_tokenizer_config(&dir.join(TOKENIZER_CONFIG_FILE));
        Ok(tokenizer)
    }

    fn apply_tokenizer_config(&mut self, path: &Path) {
        let Ok(contents) = fs::read_to_string(path) else {
            return;
        };
        let Ok(config) = serde_json::from_str::<Value>(&contents) else {
            warn!(path = %path.display(), "ignoring unparsable tokenizer config");
            return;
        };
        let lookup = |key: &str| -> Option<u32> {
            let token = match config.get(key)? {
                Value::String(s) => s.as_str(),
                Value::Object(o) => o.get("content")?.as_str()?,
                _ => return None,
            };
            self.inner.token_to_id(token)
        };
        let (bos, eos, pad) = (lookup("bos_token"), lookup("eos_token"), lookup("pad_token"));
        self.bos_token_id = bos.or(self.bos_token_id);
        self.eos_token_id = eos.or(self.eos_token_id);
        self.pad_token_id = pad.or(self.pad_token_id);
        debug!(
            bos = ?self.bos_token_id,
            eos = ?self.eos_token_id,
            pad = ?self.pad_token_id,
            "special tokens"
        );
    }

    /// Encode text to token IDs, optionally prepending BOS.
    pub fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| PocketError::Generation(format!("failed to encode text: {}", e)))?;

        let mut ids: Vec<u32> = encoding.get_ids().to_vec();

        if add_bos {
            if let Some(bos) = self.bos_token_id {
                if ids.first() != Some(&bos) {
                    ids.insert(0, bos);
                }
            }
        }

        Ok(ids)
    }

    /// Decode token IDs to text.
    pub fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special)
            .map_err(|e| PocketError::Generation(format!("failed to decode tokens: {}", e)))
    }

    /// Get vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Get BOS token ID.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Get EOS token ID.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// Get PAD token ID.
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    /// Chat end-of-turn token ID (`<|end|>` for Phi-3).
    pub fn end_of_turn_id(&self) -> Option<u32> {
        self.end_of_turn_id
    }

    /// Token to string (for debugging).
    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// String to token ID.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .field("pad_token_id", &self.pad_token_id)
            .field("end_of_turn_id", &self.end_of_turn_id)
            .finish()
    }
}

/// Degraded codec used when no real tokenizer is available.
///
/// Encoding maps the i-th whitespace-separated word to `1000 + i`
/// (reduced modulo the vocabulary when one is known). Decoding reports
/// only how many tokens it was given. Nothing it produces is text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderTokenizer {
    vocab_size: Option<usize>,
}

impl PlaceholderTokenizer {
    /// First id handed out.
    pub const BASE_ID: u32 = 1000;

    /// Placeholder whose ids stay below `vocab_size`.
    pub fn with_vocab_size(vocab_size: usize) -> Self {
        Self {
            vocab_size: (vocab_size > 0).then_some(vocab_size),
        }
    }

    /// Word `i` becomes `BASE_ID + i`.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .enumerate()
            .map(|(i, _)| {
                let id = Self::BASE_ID as usize + i;
                match self.vocab_size {
                    Some(v) => (id % v) as u32,
                    None => id as u32,
                }
            })
            .collect()
    }

    /// `"[Decoded: N tokens]"`.
    pub fn decode(&self, ids: &[u32]) -> String {
        format!("[Decoded: {} tokens]", ids.len())
    }
}

/// Either a real tokenizer or the flagged placeholder.
#[derive(Debug, Clone)]
pub enum TokenizerBridge {
    /// `tokenizer.json` or `tokenizer.model` loaded.
    Hf(Tokenizer),
    /// Fallback codec; output is not meaningful text.
    Placeholder(PlaceholderTokenizer),
}

impl TokenizerBridge {
    /// Load the real tokenizer or fail with [`PocketError::TokenizerUnavailable`].
    pub fn load(dir: &Path) -> Result<Self> {
        Tokenizer::from_dir(dir).map(Self::Hf)
    }

    /// Load the real tokenizer, falling back to the placeholder with a warning.
    ///
    /// `vocab_size` bounds the placeholder's ids; pass the model's
    /// embedding rows so every id is a valid input.
    pub fn load_or_placeholder(dir: &Path, vocab_size: usize) -> Self {
        match Self::load(dir) {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!(
                    error = %e,
                    "falling back to placeholder tokenizer; encoded ids and decoded text are not meaningful"
                );
                Self::Placeholder(PlaceholderTokenizer::with_vocab_size(vocab_size))
            }
        }
    }

    /// Whether this is the degraded placeholder codec.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    /// Encode text, prepending BOS when requested and known.
    pub fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        match self {
            Self::Hf(t) => t.encode(text, add_bos),
            Self::Placeholder(p) => Ok(p.encode(text)),
        }
    }

    /// Decode ids, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::Hf(t) => t.decode(ids, true),
            Self::Placeholder(p) => Ok(p.decode(ids)),
        }
    }

    /// BOS id, if the tokenizer defines one.
    pub fn bos_token_id(&self) -> Option<u32> {
        match self {
            Self::Hf(t) => t.bos_token_id(),
            Self::Placeholder(_) => None,
        }
    }

    /// EOS id, if the tokenizer defines one.
    pub fn eos_token_id(&self) -> Option<u32> {
        match self {
            Self::Hf(t) => t.eos_token_id(),
            Self::Placeholder(_) => None,
        }
    }

    /// Tokens that end generation in addition to the model's EOS.
    pub fn stop_token_ids(&self) -> Vec<u32> {
        match self {
            Self::Hf(t) => t
                .eos_token_id()
                .into_iter()
                .chain(t.end_of_turn_id())
                .collect(),
            Self::Placeholder(_) => Vec::new(),
        }
    }
}
