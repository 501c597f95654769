//! Model configuration.
//!
//! `config.json` is deserialized with every key optional, then filled
//! from a table of per-architecture defaults. Missing keys never fail; a
//! key that is present with the wrong JSON type is a [`PocketError::Config`].

use super::Architecture;
use crate::error::{PocketError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Default hyperparameters applied when `config.json` omits a key.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDefaults {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// KV heads default to `num_attention_heads / kv_head_divisor` (at least 1).
    pub kv_head_divisor: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// BOS token id.
    pub bos_token_id: u32,
    /// EOS token id.
    pub eos_token_id: u32,
    /// PAD token id.
    pub pad_token_id: u32,
    /// RoPE base.
    pub rope_theta: f64,
    /// Normalization epsilon.
    pub norm_eps: f64,
}

impl ConfigDefaults {
    /// Gemma-3 270M defaults.
    pub fn gemma() -> Self {
        Self {
            vocab_size: 262_144,
            hidden_size: 640,
            num_hidden_layers: 18,
            num_attention_heads: 4,
            kv_head_divisor: 4,
            intermediate_size: 2048,
            max_position_embeddings: 32_768,
            bos_token_id: 2,
            eos_token_id: 1,
            pad_token_id: 0,
            rope_theta: 1_000_000.0,
            norm_eps: 1e-6,
        }
    }

    /// Phi-3 mini defaults.
    pub fn phi3() -> Self {
        Self {
            vocab_size: 32_064,
            hidden_size: 3072,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            kv_head_divisor: 1,
            intermediate_size: 8192,
            max_position_embeddings: 4096,
            bos_token_id: 1,
            eos_token_id: 32_000,
            pad_token_id: 0,
            rope_theta: 10_000.0,
            norm_eps: 1e-5,
        }
    }

    /// Defaults for an architecture.
    pub fn for_architecture(arch: Architecture) -> Self {
        match arch {
            Architecture::GemmaSmall => Self::gemma(),
            Architecture::Phi3Mini => Self::phi3(),
        }
    }
}

/// Configuration for a transformer model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA).
    pub num_key_value_heads: usize,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Per-head dimension, explicit or `hidden_size / num_attention_heads`.
    pub head_dim: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// End-of-sequence token.
    pub eos_token_id: u32,
    /// Beginning-of-sequence token.
    pub bos_token_id: u32,
    /// Padding token.
    pub pad_token_id: u32,
    /// Rope theta.
    pub rope_theta: f64,
    /// Rope base for sliding-window layers, when the checkpoint declares one.
    pub rope_local_base_freq: Option<f64>,
    /// Norm epsilon (`rms_norm_eps` or `layer_norm_eps`).
    pub norm_eps: f64,
    /// Declared weight tying. Informational; tying is decided by which tensors exist.
    pub tie_word_embeddings: Option<bool>,
}

impl ModelConfig {
    /// Parse a `config.json` value using the given defaults.
    pub fn from_value(value: &Value, defaults: &ConfigDefaults) -> Result<Self> {
        if !value.is_object() {
            return Err(PocketError::Config(
                "config root must be a JSON object".to_string(),
            ));
        }
        let raw = RawConfig::deserialize(value)
            .map_err(|e| PocketError::Config(format!("malformed config.json: {}", e)))?;
        raw.resolve(defaults)
    }

    /// Parse a JSON string.
    pub fn from_json_str(json: &str, defaults: &ConfigDefaults) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(&value, defaults)
    }

    /// Load from JSON file.
    pub fn from_file(path: &Path, defaults: &ConfigDefaults) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents, defaults)
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Width of the concatenated query heads.
    pub fn q_width(&self) -> usize {
        self.num_attention_heads * self.head_dim
    }

    /// Width of the concatenated key (or value) heads.
    pub fn kv_width(&self) -> usize {
        self.num_key_value_heads * self.head_dim
    }
}

/// `config.json` as written: every key optional, types checked by serde.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    vocab_size: Option<usize>,
    hidden_size: Option<usize>,
    intermediate_size: Option<usize>,
    num_attention_heads: Option<usize>,
    num_key_value_heads: Option<usize>,
    num_hidden_layers: Option<usize>,
    head_dim: Option<usize>,
    max_position_embeddings: Option<usize>,
    eos_token_id: Option<TokenIds>,
    bos_token_id: Option<TokenIds>,
    pad_token_id: Option<TokenIds>,
    rope_theta: Option<f64>,
    rope_local_base_freq: Option<f64>,
    rms_norm_eps: Option<f64>,
    layer_norm_eps: Option<f64>,
    tie_word_embeddings: Option<bool>,
}

/// Token ids may be a scalar or a list; the first list element wins.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    fn first(&self) -> Option<u32> {
        match self {
            TokenIds::One(id) => Some(*id),
            TokenIds::Many(ids) => ids.first().copied(),
        }
    }
}

impl RawConfig {
    fn resolve(self, defaults: &ConfigDefaults) -> Result<ModelConfig> {
        let num_attention_heads = self
            .num_attention_heads
            .unwrap_or(defaults.num_attention_heads);
        if num_attention_heads == 0 {
            return Err(PocketError::Config(
                "num_attention_heads must be positive".to_string(),
            ));
        }
        let hidden_size = self.hidden_size.unwrap_or(defaults.hidden_size);

        let num_key_value_heads = self
            .num_key_value_heads
            .unwrap_or_else(|| (num_attention_heads / defaults.kv_head_divisor.max(1)).max(1));
        if num_key_value_heads == 0
            || num_key_value_heads > num_attention_heads
            || num_attention_heads % num_key_value_heads != 0
        {
            return Err(PocketError::Config(format!(
                "num_key_value_heads ({}) must divide num_attention_heads ({})",
                num_key_value_heads, num_attention_heads
            )));
        }

        let head_dim = self
            .head_dim
            .unwrap_or(hidden_size / num_attention_heads);
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(PocketError::Config(format!(
                "head_dim must be a positive even number, got {}",
                head_dim
            )));
        }

        let token = |ids: &Option<TokenIds>, default: u32| {
            ids.as_ref().and_then(TokenIds::first).unwrap_or(default)
        };

        Ok(ModelConfig {
            vocab_size: self.vocab_size.unwrap_or(defaults.vocab_size),
            hidden_size,
            intermediate_size: self.intermediate_size.unwrap_or(defaults.intermediate_size),
            num_attention_heads,
            num_key_value_heads,
            num_hidden_layers: self.num_hidden_layers.unwrap_or(defaults.num_hidden_layers),
            head_dim,
            max_position_embeddings: self
                .max_position_embeddings
                .unwrap_or(defaults.max_position_embeddings),
            eos_token_id: token(&self.eos_token_id, defaults.eos_token_id),
            bos_token_id: token(&self.bos_token_id, defaults.bos_token_id),
            pad_token_id: token(&self.pad_token_id, defaults.pad_token_id),
            rope_theta: self.rope_theta.unwrap_or(defaults.rope_theta),
            rope_local_base_freq: self.rope_local_base_freq,
            norm_eps: self
                .rms_norm_eps
                .or(self.layer_norm_eps)
                .unwrap_or(defaults.norm_eps),
            tie_word_embeddings: self.tie_word_embeddings,
        })
    }
}
