//! Architecture detection.
//!
//! The first entry of the `architectures` array in `config.json` decides
//! which loader builds the model. Detection happens once; the tag never
//! changes for a loaded model.

use crate::error::{PocketError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    /// Gemma-3 style small model (LayerNorm, tied head, GQA).
    GemmaSmall,
    /// Phi-3 mini (RMSNorm, fused qkv / gate_up projections).
    Phi3Mini,
}

impl Architecture {
    /// All registered architectures.
    pub const ALL: [Architecture; 2] = [Architecture::GemmaSmall, Architecture::Phi3Mini];

    /// Map an `architectures[0]` identifier to a tag.
    ///
    /// Matching is by substring, so `Gemma3ForCausalLM`, `GemmaForCausalLM`,
    /// `Phi3ForCausalLM` and `Phi-3-mini` are all recognised.
    pub fn from_identifier(identifier: &str) -> Result<Self> {
        if identifier.contains("Gemma") {
            Ok(Self::GemmaSmall)
        } else if identifier.contains("Phi3") || identifier.contains("Phi-3") {
            Ok(Self::Phi3Mini)
        } else {
            Err(PocketError::UnsupportedArchitecture(identifier.to_string()))
        }
    }

    /// Detect the architecture from a parsed `config.json`.
    pub fn detect(config: &Value) -> Result<Self> {
        let first = config
            .get("architectures")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(Value::as_str)
            .ok_or_else(|| PocketError::Config("no architecture specified".to_string()))?;
        Self::from_identifier(first)
    }

    /// Canonical `architectures[0]` value written by Hugging Face exports.
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::GemmaSmall => "Gemma3ForCausalLM",
            Self::Phi3Mini => "Phi3ForCausalLM",
        }
    }

    /// Human readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::GemmaSmall => "Gemma 3 270M",
            Self::Phi3Mini => "Phi-3 Mini 3.8B",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}
