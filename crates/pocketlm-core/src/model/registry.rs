//! Model registry.
//!
//! Every supported family implements [`CausalLm`] (the inference
//! contract) and provides a [`ModelLoader`]. [`ModelRegistry`] reads
//! `config.json`, detects the [`Architecture`] and hands the directory
//! to the matching loader. A load either returns a complete model or an
//! error; nothing partially built escapes.

use super::{
    Architecture, ConfigDefaults, KvCache, ModelConfig, ModelOptions, Transformer, WeightTable,
};
use crate::error::{PocketError, Result};
use crate::quantization::{dequantize_table, is_quantized};
use candle_core::{Device, Tensor};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

/// Name of the hyperparameter document in a checkpoint directory.
pub const CONFIG_FILE: &str = "config.json";

/// Inference contract shared by every architecture.
pub trait CausalLm: Send + Sync + fmt::Debug {
    /// Architecture tag.
    fn architecture(&self) -> Architecture;

    /// Hyperparameters as used by the loaded weights.
    fn config(&self) -> &ModelConfig;

    /// Run `tokens` after the cached prefix; returns `[1, tokens.len(), vocab]`.
    ///
    /// On error the cache is unchanged.
    fn forward(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor>;

    /// Single inference step: like [`CausalLm::forward`] but returns only
    /// the last position's logits `[vocab]`.
    fn step(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor>;

    /// An empty cache with one slot per layer.
    fn new_cache(&self) -> KvCache;

    /// Number of token ids accepted as input (embedding table rows).
    ///
    /// May differ from `config().vocab_size` when the config disagrees
    /// with the checkpoint.
    fn embedding_rows(&self) -> usize;
}

/// Builds one architecture from a checkpoint directory.
pub trait ModelLoader: Send + Sync {
    /// Architecture this loader builds.
    fn architecture(&self) -> Architecture;

    /// Load weights from `dir`; `config` is the parsed `config.json`.
    fn load(&self, dir: &Path, config: &Value, device: &Device) -> Result<Box<dyn CausalLm>>;
}

/// Architecture-keyed set of loaders.
pub struct ModelRegistry {
    loaders: HashMap<Architecture, Box<dyn ModelLoader>>,
}

impl ModelRegistry {
    /// A registry with no loaders.
    pub fn empty() -> Self {
        Self {
            loaders: HashMap::new(),
        }
    }

    /// A registry with the Gemma and Phi-3 loaders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(super::gemma::GemmaLoader));
        registry.register(Box::new(super::phi3::Phi3Loader));
        registry
    }

    /// Add or replace the loader for its architecture.
    pub fn register(&mut self, loader: Box<dyn ModelLoader>) {
        self.loaders.insert(loader.architecture(), loader);
    }

    /// Whether a loader exists for `architecture`.
    pub fn supports(&self, architecture: Architecture) -> bool {
        self.loaders.contains_key(&architecture)
    }

    /// Read `config.json` from `dir`, detect the architecture and load.
    pub fn load_model(&self, dir: &Path, device: &Device) -> Result<Box<dyn CausalLm>> {
        let config_path = dir.join(CONFIG_FILE);
        let contents = fs::read_to_string(&config_path).map_err(|e| {
            PocketError::Config(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        let config: Value = serde_json::from_str(&contents)?;
        let architecture = Architecture::detect(&config)?;
        info!(architecture = %architecture, dir = %dir.display(), "detected architecture");

        let loader = self
            .loaders
            .get(&architecture)
            .ok_or_else(|| PocketError::UnsupportedArchitecture(architecture.to_string()))?;
        loader.load(dir, &config, device)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut archs: Vec<_> = self.loaders.keys().map(|a| a.display_name()).collect();
        archs.sort_unstable();
        f.debug_struct("ModelRegistry").field("loaders", &archs).finish()
    }
}

/// Load a model directory with the default registry.
pub fn load_model(dir: &Path, device: &Device) -> Result<Box<dyn CausalLm>> {
    ModelRegistry::with_defaults().load_model(dir, device)
}

/// Shared load path for the concrete loaders.
///
/// Parses the config against the architecture's defaults, reads every
/// checkpoint file, dequantizes packed weights and builds the model.
pub(crate) fn load_transformer(
    dir: &Path,
    config: &Value,
    architecture: Architecture,
    device: &Device,
) -> Result<Transformer> {
    let config = ModelConfig::from_value(config, &ConfigDefaults::for_architecture(architecture))?;
    let table = WeightTable::from_dir(dir, device)?;
    info!(tensors = table.len(), "loaded weight table");

    let table = if is_quantized(&table) {
        dequantize_table(table, &|name| expected_input_width(name, &config))?
    } else {
        table
    };

    Transformer::load(
        &table,
        &config,
        architecture,
        ModelOptions::for_architecture(architecture),
        device,
    )
}

/// Expected input width of a projection or vocabulary table, by
/// checkpoint tensor name.
///
/// Used as the column-expansion target when dequantizing. Embedding
/// tables and the output head both expand to the hidden width.
pub(crate) fn expected_input_width(name: &str, config: &ModelConfig) -> Option<usize> {
    if name.contains("down_proj") || name.contains(".w2.") {
        Some(config.intermediate_size)
    } else if name.contains("o_proj") || name.contains(".wo.") {
        Some(config.q_width())
    } else if name.contains("_proj")
        || name.contains("lm_head")
        || name.contains("embed_tokens")
        || name.contains("tok_embeddings")
        || name.contains(".attention.w")
        || name.contains(".w1.")
        || name.contains(".w3.")
    {
        Some(config.hidden_size)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::synthetic::SyntheticCheckpoint;
    use crate::model::ConfigDefaults;
    use serde_json::json;

    #[test]
    fn default_registry_supports_both_families() {
        let registry = ModelRegistry::with_defaults();
        for arch in Architecture::ALL {
            assert!(registry.supports(arch));
        }
        assert!(format!("{:?}", registry).contains("Phi-3"));
    }

    #[test]
    fn loads_each_architecture_from_disk() {
        for arch in Architecture::ALL {
            let dir = tempfile::tempdir().unwrap();
            SyntheticCheckpoint::counting(arch)
                .unwrap()
                .write_to(dir.path())
                .unwrap();

            let model = load_model(dir.path(), &Device::Cpu).unwrap();
            assert_eq!(model.architecture(), arch);
            assert_eq!(model.config().num_hidden_layers, SyntheticCheckpoint::LAYERS);

            let mut cache = model.new_cache();
            let logits = model.step(&[3, 7, 1], &mut cache).unwrap();
            assert_eq!(crate::model::argmax(&logits).unwrap(), 2);
        }
    }

    #[test]
    fn sharded_checkpoint_matches_single_file() {
        let ckpt = SyntheticCheckpoint::random(Architecture::Phi3Mini, 11).unwrap();
        let single = tempfile::tempdir().unwrap();
        let sharded = tempfile::tempdir().unwrap();
        ckpt.write_to(single.path()).unwrap();
        ckpt.write_sharded(sharded.path(), 2).unwrap();

        let a = load_model(single.path(), &Device::Cpu).unwrap();
        let b = load_model(sharded.path(), &Device::Cpu).unwrap();
        let la = a.step(&[1, 2, 3], &mut a.new_cache()).unwrap();
        let lb = b.step(&[1, 2, 3], &mut b.new_cache()).unwrap();
        let diff: f32 = (la - lb).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn unsupported_architecture_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            json!({ "architectures": ["MambaForCausalLM"] }).to_string(),
        )
        .unwrap();
        let err = load_model(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, PocketError::UnsupportedArchitecture(ref s) if s == "MambaForCausalLM"));
    }

    #[test]
    fn registry_without_loader_rejects_known_architecture() {
        let dir = tempfile::tempdir().unwrap();
        SyntheticCheckpoint::counting(Architecture::GemmaSmall)
            .unwrap()
            .write_to(dir.path())
            .unwrap();
        let err = ModelRegistry::empty()
            .load_model(dir.path(), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, PocketError::UnsupportedArchitecture(_)));
    }

    #[test]
    fn missing_config_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, PocketError::Config(_)));
    }

    #[test]
    fn malformed_hyperparameter_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = SyntheticCheckpoint::counting(Architecture::Phi3Mini).unwrap();
        ckpt.config_json["vocab_size"] = json!("sixteen");
        ckpt.write_to(dir.path()).unwrap();
        assert!(matches!(
            load_model(dir.path(), &Device::Cpu),
            Err(PocketError::Config(_))
        ));
    }

    #[test]
    fn expected_widths_by_name() {
        let config = ModelConfig::from_json_str(
            r#"{"hidden_size": 64, "num_attention_heads": 4, "head_dim": 32, "intermediate_size": 256}"#,
            &ConfigDefaults::phi3(),
        )
        .unwrap();
        let w = |n| expected_input_width(n, &config);
        assert_eq!(w("model.layers.0.mlp.down_proj.weight"), Some(256));
        assert_eq!(w("model.layers.0.self_attn.o_proj.weight"), Some(128));
        assert_eq!(w("model.layers.0.self_attn.qkv_proj.weight"), Some(64));
        assert_eq!(w("lm_head.weight"), Some(64));
        assert_eq!(w("model.embed_tokens.weight"), Some(64));
        assert_eq!(w("model.norm.weight"), None);
    }

    #[test]
    fn packed_embedding_expands_to_hidden_width() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = SyntheticCheckpoint::counting(Architecture::Phi3Mini).unwrap();
        let embed = &ckpt.tensors["model.embed_tokens.weight"];
        let even = Tensor::new(&[0u32, 2, 4, 6], &Device::Cpu).unwrap();
        let packed = embed.index_select(&even, 1).unwrap();
        assert_eq!(packed.dims(), &[SyntheticCheckpoint::VOCAB, 4]);
        let vocab = SyntheticCheckpoint::VOCAB;
        ckpt.tensors
            .insert("model.embed_tokens.weight".to_string(), packed);
        ckpt.tensors.insert(
            "model.embed_tokens.scales".to_string(),
            Tensor::ones((vocab, 1), candle_core::DType::F32, &Device::Cpu).unwrap(),
        );
        ckpt.tensors.insert(
            "model.embed_tokens.biases".to_string(),
            Tensor::zeros((vocab, 1), candle_core::DType::F32, &Device::Cpu).unwrap(),
        );
        ckpt.write_to(dir.path()).unwrap();

        let model = load_model(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(model.config().hidden_size, SyntheticCheckpoint::HIDDEN);
        let logits = model.step(&[3, 7, 1], &mut model.new_cache()).unwrap();
        assert_eq!(crate::model::argmax(&logits).unwrap(), 2);
    }

    #[test]
    fn quantized_tied_head_uses_expanded_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = SyntheticCheckpoint::counting(Architecture::GemmaSmall).unwrap();
        ckpt.tensors.remove("lm_head.weight");
        let ckpt = ckpt.affine_quantized(4).unwrap();
        assert_eq!(
            ckpt.tensors["model.embed_tokens.weight"].dims(),
            &[SyntheticCheckpoint::VOCAB, SyntheticCheckpoint::HIDDEN / 2]
        );
        ckpt.write_to(dir.path()).unwrap();

        let model = load_model(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(model.embedding_rows(), SyntheticCheckpoint::VOCAB);
        // Tied head scores each token by similarity to itself
        let logits = model.step(&[5], &mut model.new_cache()).unwrap();
        assert_eq!(logits.dims(), &[SyntheticCheckpoint::VOCAB]);
        assert_eq!(crate::model::argmax(&logits).unwrap(), 5);
    }
}
