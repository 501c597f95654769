//! High-level inference engine.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use parking_lot::RwLock;
use pocketlm_core::{
    generation::{generate, SamplingParams, StopReason},
    model::{Architecture, CausalLm, KvCache, ModelConfig, ModelRegistry, Phi3PromptBuilder, TokenizerBridge},
    PocketError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

type SharedModel = Arc<RwLock<Option<Box<dyn CausalLm>>>>;

/// Configuration for the inference engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Checkpoint directory.
    pub model_path: PathBuf,
    /// Device the weights are loaded onto.
    pub device: Device,
    /// Default sampling parameters for new requests.
    pub sampling: SamplingParams,
    /// Fall back to the placeholder codec when no tokenizer loads.
    pub allow_placeholder_tokenizer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            device: Device::Cpu,
            sampling: SamplingParams::default(),
            allow_placeholder_tokenizer: true,
        }
    }
}

/// Builder for creating an Engine.
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<ModelRegistry>,
}

impl EngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: None,
        }
    }

    /// Set the checkpoint directory.
    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = path.into();
        self
    }

    /// Set the device.
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    /// Set default sampling parameters.
    pub fn sampling(mut self, params: SamplingParams) -> Self {
        self.config.sampling = params;
        self
    }

    /// Fail the build instead of degrading to the placeholder tokenizer.
    pub fn require_tokenizer(mut self) -> Self {
        self.config.allow_placeholder_tokenizer = false;
        self
    }

    /// Use a custom registry instead of the default loaders.
    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Load the model off the async executor and build the engine.
    ///
    /// The engine is only returned once the model is fully constructed.
    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        anyhow::ensure!(
            !config.model_path.as_os_str().is_empty(),
            "no model path configured"
        );
        let registry = self.registry.unwrap_or_default();

        let load_config = config.clone();
        let (model, tokenizer) = tokio::task::spawn_blocking(move || -> Result<_> {
            let dir = &load_config.model_path;
            let model = registry
                .load_model(dir, &load_config.device)
                .with_context(|| format!("failed to load model from {}", dir.display()))?;
            let tokenizer = if load_config.allow_placeholder_tokenizer {
                TokenizerBridge::load_or_placeholder(dir, model.embedding_rows())
            } else {
                TokenizerBridge::load(dir)?
            };
            Ok((model, tokenizer))
        })
        .await
        .context("model loading task panicked")??;

        let architecture = model.architecture();
        info!(
            architecture = %architecture,
            layers = model.config().num_hidden_layers,
            placeholder_tokenizer = tokenizer.is_placeholder(),
            "engine ready"
        );

        Ok(Engine {
            config,
            architecture,
            model: Arc::new(RwLock::new(Some(model))),
            tokenizer: Arc::new(tokenizer),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// High-level inference engine.
pub struct Engine {
    config: EngineConfig,
    architecture: Architecture,
    model: SharedModel,
    tokenizer: Arc<TokenizerBridge>,
}

impl Engine {
    /// Create a new engine builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Architecture of the loaded checkpoint.
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// The tokenizer bridge.
    pub fn tokenizer(&self) -> &TokenizerBridge {
        &self.tokenizer
    }

    /// Whether the model is still loaded.
    pub fn is_loaded(&self) -> bool {
        self.model.read().is_some()
    }

    /// Hyperparameters of the loaded model.
    pub fn model_config(&self) -> Result<ModelConfig> {
        let guard = self.model.read();
        let model = guard.as_ref().ok_or(PocketError::Unloaded)?;
        Ok(model.config().clone())
    }

    /// An empty cache sized for the loaded model.
    pub fn new_cache(&self) -> Result<KvCache> {
        let guard = self.model.read();
        let model = guard.as_ref().ok_or(PocketError::Unloaded)?;
        Ok(model.new_cache())
    }

    /// Run one inference step; returns last-position logits `[vocab]`.
    pub fn step(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        let guard = self.model.read();
        let model = guard.as_ref().ok_or(PocketError::Unloaded)?;
        Ok(model.step(tokens, cache)?)
    }

    /// Release the weights. Later calls fail with [`PocketError::Unloaded`].
    pub fn unload(&self) {
        if self.model.write().take().is_some() {
            info!(architecture = %self.architecture, "model unloaded");
        }
    }

    /// Generate text from a prompt.
    pub fn generate(&self, prompt: &str) -> GenerateRequest<'_> {
        GenerateRequest {
            engine: self,
            prompt: prompt.to_string(),
            params: self.config.sampling.clone(),
            chat_system: None,
        }
    }
}

/// A generation request.
pub struct GenerateRequest<'a> {
    engine: &'a Engine,
    prompt: String,
    params: SamplingParams,
    chat_system: Option<String>,
}

impl<'a> GenerateRequest<'a> {
    /// Set maximum tokens to generate.
    pub fn max_tokens(mut self, n: usize) -> Self {
        self.params.max_new_tokens = n;
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, t: f32) -> Self {
        self.params.temperature = t;
        self
    }

    /// Set top-k.
    pub fn top_k(mut self, k: usize) -> Self {
        self.params.top_k = k;
        self
    }

    /// Set the sampler seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.params.seed = seed;
        self
    }

    /// Wrap the prompt in the model's chat template with `system` as the
    /// system prompt, and stop on the tokenizer's end-of-turn tokens.
    pub fn chat(mut self, system: impl Into<String>) -> Self {
        self.chat_system = Some(system.into());
        self
    }

    fn rendered_prompt(&self) -> String {
        match (&self.chat_system, self.engine.architecture) {
            (Some(system), Architecture::Phi3Mini) => {
                Phi3PromptBuilder::new(system.as_str()).build_prompt(&self.prompt)
            }
            (Some(_), architecture) => {
                debug!(%architecture, "no chat template; using raw prompt");
                self.prompt.clone()
            }
            (None, _) => self.prompt.clone(),
        }
    }

    /// Execute the generation.
    pub async fn execute(self) -> Result<GenerateResult> {
        let prompt = self.rendered_prompt();
        let tokenizer = Arc::clone(&self.engine.tokenizer);
        let model = Arc::clone(&self.engine.model);
        let mut params = self.params;
        if self.chat_system.is_some() {
            params.stop_token_ids.extend(tokenizer.stop_token_ids());
        }

        tokio::task::spawn_blocking(move || -> Result<GenerateResult> {
            let prompt_tokens = tokenizer.encode(&prompt, true)?;

            let guard = model.read();
            let model = guard.as_ref().ok_or(PocketError::Unloaded)?;
            let output = generate(model.as_ref(), &prompt_tokens, &params)?;
            drop(guard);

            let text = tokenizer.decode(&output.tokens)?;
            Ok(GenerateResult {
                text,
                num_prompt_tokens: output.num_prompt_tokens,
                num_generated_tokens: output.tokens.len(),
                tokens: output.tokens,
                stop_reason: output.stop_reason,
                placeholder_tokenizer: tokenizer.is_placeholder(),
            })
        })
        .await
        .context("generation task panicked")?
    }
}

/// Result of text generation.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Generated text.
    pub text: String,
    /// Generated token IDs.
    pub tokens: Vec<u32>,
    /// Number of prompt tokens.
    pub num_prompt_tokens: usize,
    /// Number of generated tokens.
    pub num_generated_tokens: usize,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// `text` came from the placeholder codec and is not meaningful.
    pub placeholder_tokenizer: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("architecture", &self.architecture)
            .field("loaded", &self.is_loaded())
            .field("tokenizer", &self.tokenizer)
            .finish()
    }
}
