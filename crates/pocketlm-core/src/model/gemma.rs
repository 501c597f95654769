//! Gemma-family loader.
//!
//! Gemma checkpoints usually tie the output head to the embedding table,
//! use separate Q/K/V projections and a grouped KV layout. Norms are
//! mean-centred LayerNorm.

use super::registry::{load_transformer, CausalLm, ModelLoader};
use super::Architecture;
use crate::error::Result;
use candle_core::Device;
use serde_json::Value;
use std::path::Path;

/// Loader for [`Architecture::GemmaSmall`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GemmaLoader;

impl ModelLoader for GemmaLoader {
    fn architecture(&self) -> Architecture {
        Architecture::GemmaSmall
    }

    fn load(&self, dir: &Path, config: &Value, device: &Device) -> Result<Box<dyn CausalLm>> {
        Ok(Box::new(load_transformer(
            dir,
            config,
            Architecture::GemmaSmall,
            device,
        )?))
    }
}
