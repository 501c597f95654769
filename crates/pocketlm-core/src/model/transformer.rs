//! Full decoder model.
//!
//! Embeds tokens, runs every [`TransformerBlock`] with its cache slot,
//! applies the final norm and the output head.

use super::{
    Architecture, CausalLm, KvCache, LayerPart, Linear, ModelConfig, Norm, NormKind, RopeStyle,
    RotaryEmbedding, TensorRole, TransformerBlock, WeightResolver, WeightTable,
};
use crate::error::{PocketError, Result};
use candle_core::{Device, Tensor, D};
use tracing::{debug, info, warn};

/// Architecture-specific choices that are not in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Normalization variant for every norm in the model.
    pub norm: NormKind,
    /// Rotary pairing convention.
    pub rope: RopeStyle,
}

impl ModelOptions {
    /// Gemma: LayerNorm, half-split rotary pairs.
    pub const GEMMA: Self = Self {
        norm: NormKind::Layer,
        rope: RopeStyle::HalfSplit,
    };

    /// Phi-3: RMSNorm, half-split rotary pairs.
    pub const PHI3: Self = Self {
        norm: NormKind::Rms,
        rope: RopeStyle::HalfSplit,
    };

    /// Options used when loading `architecture`.
    pub fn for_architecture(architecture: Architecture) -> Self {
        match architecture {
            Architecture::GemmaSmall => Self::GEMMA,
            Architecture::Phi3Mini => Self::PHI3,
        }
    }
}

/// Output projection, fixed at load time.
#[derive(Debug, Clone)]
pub enum LmHead {
    /// A dedicated `[vocab, hidden]` matrix.
    Explicit(Linear),
    /// The embedding table reused as `[vocab, hidden]`.
    Tied(Tensor),
}

impl LmHead {
    /// Project `[..., hidden]` to `[..., vocab]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            LmHead::Explicit(linear) => linear.forward(x),
            LmHead::Tied(embedding) => {
                let (batch, seq, hidden) = x.dims3()?;
                let logits = x.reshape((batch * seq, hidden))?.matmul(&embedding.t()?)?;
                Ok(logits.reshape((batch, seq, embedding.dim(0)?))?)
            }
        }
    }

    /// Whether the head shares the embedding table.
    pub fn is_tied(&self) -> bool {
        matches!(self, LmHead::Tied(_))
    }

    /// Number of logits produced.
    pub fn vocab_size(&self) -> usize {
        match self {
            LmHead::Explicit(linear) => linear.out_features(),
            LmHead::Tied(embedding) => embedding.dims()[0],
        }
    }

    fn in_features(&self) -> usize {
        match self {
            LmHead::Explicit(linear) => linear.in_features(),
            LmHead::Tied(embedding) => embedding.dims()[1],
        }
    }
}

/// A loaded decoder-only transformer.
#[derive(Debug, Clone)]
pub struct Transformer {
    /// Model configuration, with `hidden_size` set to the width actually used.
    config: ModelConfig,
    architecture: Architecture,
    /// Token embeddings `[vocab, embed_width]`.
    embed_tokens: Tensor,
    /// Maps embedding width to hidden width when they differ.
    embed_proj: Option<Linear>,
    layers: Vec<TransformerBlock>,
    norm: Norm,
    lm_head: LmHead,
    rope: RotaryEmbedding,
    device: Device,
}

impl Transformer {
    /// Build the model from a (dequantized) weight table.
    ///
    /// The residual width is taken from the checkpoint, not the config:
    /// the embedding table's last dimension, or the embedding projection's
    /// output when one is present. The output head is the explicit
    /// `lm_head` when the table has one and the embedding table otherwise.
    pub fn load(
        table: &WeightTable,
        config: &ModelConfig,
        architecture: Architecture,
        options: ModelOptions,
        device: &Device,
    ) -> Result<Self> {
        let resolver = WeightResolver::new(table);

        let embed_tokens = resolver.resolve(TensorRole::Embedding)?;
        if embed_tokens.rank() != 2 {
            return Err(PocketError::ShapeMismatch(format!(
                "embedding table must be 2D, got {:?}",
                embed_tokens.dims()
            )));
        }
        let (vocab, embed_width) = embed_tokens.dims2()?;
        if embed_width != config.hidden_size {
            warn!(
                config = config.hidden_size,
                embedding = embed_width,
                "hidden_size disagrees with embedding width; using checkpoint widths"
            );
        }

        let embed_proj = match resolver.resolve_optional(TensorRole::EmbeddingProjection) {
            Some(w) => {
                let proj = Linear::new(w, None)?;
                if proj.in_features() != embed_width {
                    return Err(PocketError::ShapeMismatch(format!(
                        "embedding projection expects width {}, embedding is {}",
                        proj.in_features(),
                        embed_width
                    )));
                }
                Some(proj)
            }
            None => None,
        };
        let stream_width = embed_proj
            .as_ref()
            .map_or(embed_width, |p| p.out_features());

        let block_width = if config.num_hidden_layers > 0 {
            resolver
                .resolve(TensorRole::weight(0, LayerPart::InputNorm))?
                .elem_count()
        } else {
            stream_width
        };
        if block_width != stream_width {
            let reason = if embed_proj.is_some() {
                "embedding projection output"
            } else {
                "embedding width (no embedding projection present)"
            };
            return Err(PocketError::ShapeMismatch(format!(
                "{} is {} but transformer layers expect {}",
                reason, stream_width, block_width
            )));
        }

        let mut config = config.clone();
        config.hidden_size = block_width;

        let layers = (0..config.num_hidden_layers)
            .map(|i| TransformerBlock::load(&resolver, i, &config, options.norm))
            .collect::<Result<Vec<_>>>()?;

        let norm = Norm::load(
            options.norm,
            &resolver,
            TensorRole::FinalNorm { bias: false },
            TensorRole::FinalNorm { bias: true },
            config.hidden_size,
            config.norm_eps,
        )?;

        let lm_head = if resolver.has(TensorRole::LmHead { bias: false }) {
            LmHead::Explicit(Linear::load(
                &resolver,
                TensorRole::LmHead { bias: false },
                TensorRole::LmHead { bias: true },
            )?)
        } else {
            LmHead::Tied(embed_tokens.clone())
        };
        if lm_head.in_features() != config.hidden_size {
            return Err(PocketError::ShapeMismatch(format!(
                "output head expects width {}, hidden width is {}",
                lm_head.in_features(),
                config.hidden_size
            )));
        }
        if lm_head.vocab_size() != config.vocab_size {
            debug!(
                config = config.vocab_size,
                head = lm_head.vocab_size(),
                "vocab_size differs from output head rows"
            );
        }

        let rope = RotaryEmbedding::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            options.rope,
            device,
        )?;

        info!(
            architecture = %architecture,
            layers = layers.len(),
            hidden = config.hidden_size,
            vocab,
            tied = lm_head.is_tied(),
            "model constructed"
        );

        Ok(Self {
            config,
            architecture,
            embed_tokens,
            embed_proj,
            layers,
            norm,
            lm_head,
            rope,
            device: device.clone(),
        })
    }

    /// Run `tokens` as new positions after whatever `cache` holds.
    ///
    /// Returns logits `[1, tokens.len(), vocab]`. The cache is only
    /// updated when every layer succeeds; on error it is left as it was.
    pub fn forward(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        if tokens.is_empty() {
            return Err(PocketError::Model("empty token batch".to_string()));
        }
        if cache.num_layers() != self.layers.len() {
            return Err(PocketError::Model(format!(
                "cache has {} layers, model has {}",
                cache.num_layers(),
                self.layers.len()
            )));
        }
        let vocab = self.embedding_rows();
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= vocab) {
            return Err(PocketError::Model(format!(
                "token id {} out of range for vocabulary of {}",
                bad, vocab
            )));
        }

        let ids = Tensor::new(tokens, &self.device)?;
        let mut hidden = self.embed_tokens.index_select(&ids, 0)?.unsqueeze(0)?;
        if let Some(proj) = &self.embed_proj {
            hidden = proj.forward(&hidden)?;
        }

        let mut staged = cache.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rope, staged.layer_mut(i)?)?;
        }

        let hidden = self.norm.forward(&hidden)?;
        let logits = self.lm_head.forward(&hidden)?;

        *cache = staged;
        Ok(logits)
    }

    /// Like [`Transformer::forward`] but returns only the last position's logits `[vocab]`.
    pub fn step(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        let logits = self.forward(tokens, cache)?;
        let last = logits.dim(1)? - 1;
        Ok(logits.narrow(1, last, 1)?.squeeze(1)?.squeeze(0)?)
    }

    /// Full pass from an empty cache.
    pub fn forward_full(&self, tokens: &[u32]) -> Result<Tensor> {
        let mut cache = self.new_cache();
        self.forward(tokens, &mut cache)
    }

    /// An empty cache sized for this model.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.layers.len())
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Architecture this model was loaded as.
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Number of transformer layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Output head.
    pub fn lm_head(&self) -> &LmHead {
        &self.lm_head
    }

    /// Whether an embedding projection is applied.
    pub fn has_embedding_projection(&self) -> bool {
        self.embed_proj.is_some()
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Rows of the embedding table; every input id must be below this.
    pub fn embedding_rows(&self) -> usize {
        self.embed_tokens.dims()[0]
    }
}

impl CausalLm for Transformer {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        Transformer::forward(self, tokens, cache)
    }

    fn step(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Tensor> {
        Transformer::step(self, tokens, cache)
    }

    fn new_cache(&self) -> KvCache {
        Transformer::new_cache(self)
    }

    fn embedding_rows(&self) -> usize {
        Transformer::embedding_rows(self)
    }
}

/// Index of the largest logit along the last axis of a `[vocab]` tensor.
pub fn argmax(logits: &Tensor) -> Result<u32> {
    Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::synthetic::SyntheticCheckpoint;
    use proptest::prelude::*;

    fn load(checkpoint: &SyntheticCheckpoint) -> Transformer {
        let config = checkpoint.config().unwrap();
        Transformer::load(
            &checkpoint.table(),
            &config,
            checkpoint.architecture,
            checkpoint.options(),
            &Device::Cpu,
        )
        .unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn forward_shapes() {
        let model = load(&SyntheticCheckpoint::random(Architecture::Phi3Mini, 7).unwrap());
        let mut cache = model.new_cache();
        let logits = model.forward(&[1, 2, 3], &mut cache).unwrap();
        assert_eq!(logits.dims(), &[1, 3, SyntheticCheckpoint::VOCAB]);
        assert_eq!(cache.seq_len(), 3);

        let last = model.step(&[4], &mut cache).unwrap();
        assert_eq!(last.dims(), &[SyntheticCheckpoint::VOCAB]);
        assert_eq!(cache.seq_len(), 4);
    }

    #[test]
    fn explicit_head_when_present() {
        let checkpoint = SyntheticCheckpoint::counting(Architecture::GemmaSmall).unwrap();
        let model = load(&checkpoint);
        assert!(!model.lm_head().is_tied());
    }

    #[test]
    fn tied_head_when_lm_head_absent() {
        let mut checkpoint = SyntheticCheckpoint::counting(Architecture::GemmaSmall).unwrap();
        checkpoint.tensors.remove("lm_head.weight");
        let model = load(&checkpoint);
        assert!(model.lm_head().is_tied());

        // Tied head scores each token by similarity to itself
        let logits = model.step(&[5], &mut model.new_cache()).unwrap();
        assert_eq!(argmax(&logits).unwrap(), 5);
    }

    #[test]
    fn counting_model_predicts_successor() {
        for arch in Architecture::ALL {
            let model = load(&SyntheticCheckpoint::counting(arch).unwrap());
            let mut cache = model.new_cache();
            let logits = model.step(&[3, 7, 1], &mut cache).unwrap();
            assert_eq!(argmax(&logits).unwrap(), 2, "{}", arch);
        }
    }

    #[test]
    fn missing_layer_tensor_reports_role() {
        let mut checkpoint = SyntheticCheckpoint::counting(Architecture::GemmaSmall).unwrap();
        checkpoint
            .tensors
            .remove("model.layers.1.self_attn.k_proj.weight");
        let config = checkpoint.config().unwrap();
        let err = Transformer::load(
            &checkpoint.table(),
            &config,
            checkpoint.architecture,
            checkpoint.options(),
            &Device::Cpu,
        )
        .unwrap_err();
        match err {
            PocketError::MissingTensor { role, tried, .. } => {
                assert_eq!(role, "layer 1 key projection weight");
                assert_eq!(tried[0], "model.layers.1.self_attn.k_proj.weight");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn embedding_width_mismatch_without_projection_fails() {
        let mut checkpoint = SyntheticCheckpoint::counting(Architecture::Phi3Mini).unwrap();
        let wide = Tensor::zeros(
            (SyntheticCheckpoint::VOCAB, SyntheticCheckpoint::HIDDEN + 4),
            candle_core::DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        checkpoint
            .tensors
            .insert("model.embed_tokens.weight".to_string(), wide);
        let config = checkpoint.config().unwrap();
        let err = Transformer::load(
            &checkpoint.table(),
            &config,
            checkpoint.architecture,
            checkpoint.options(),
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, PocketError::ShapeMismatch(_)));
    }

    #[test]
    fn embedding_projection_bridges_widths() {
        let mut checkpoint = SyntheticCheckpoint::counting(Architecture::Phi3Mini).unwrap();
        let hidden = SyntheticCheckpoint::HIDDEN;
        let original = checkpoint.tensors["model.embed_tokens.weight"].clone();
        // Pad embeddings with zero columns and project them back out
        let padded = Tensor::cat(
            &[
                original,
                Tensor::zeros(
                    (SyntheticCheckpoint::VOCAB, 4),
                    candle_core::DType::F32,
                    &Device::Cpu,
                )
                .unwrap(),
            ],
            1,
        )
        .unwrap();
        let proj = Tensor::cat(
            &[
                Tensor::eye(hidden, candle_core::DType::F32, &Device::Cpu).unwrap(),
                Tensor::zeros((hidden, 4), candle_core::DType::F32, &Device::Cpu).unwrap(),
            ],
            1,
        )
        .unwrap();
        checkpoint
            .tensors
            .insert("model.embed_tokens.weight".to_string(), padded);
        checkpoint
            .tensors
            .insert("model.embed_proj.weight".to_string(), proj);
        // lm_head stays [vocab, hidden]

        let model = load(&checkpoint);
        assert!(model.has_embedding_projection());
        let logits = model.step(&[3, 7, 1], &mut model.new_cache()).unwrap();
        assert_eq!(argmax(&logits).unwrap(), 2);
    }

    #[test]
    fn out_of_range_token_leaves_cache_untouched() {
        let model = load(&SyntheticCheckpoint::random(Architecture::GemmaSmall, 3).unwrap());
        let mut cache = model.new_cache();
        model.forward(&[1, 2], &mut cache).unwrap();
        let before = model.step(&[3], &mut cache.clone()).unwrap();

        let bad = SyntheticCheckpoint::VOCAB as u32;
        assert!(model.forward(&[bad], &mut cache).is_err());
        assert_eq!(cache.seq_len(), 2);

        let after = model.step(&[3], &mut cache).unwrap();
        assert!(max_abs_diff(&before, &after) == 0.0);
    }

    #[test]
    fn empty_batch_is_error() {
        let model = load(&SyntheticCheckpoint::random(Architecture::Phi3Mini, 1).unwrap());
        assert!(model.forward(&[], &mut model.new_cache()).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn incremental_steps_match_full_pass(
            tokens in prop::collection::vec(0u32..SyntheticCheckpoint::VOCAB as u32, 1..10),
            seed in 0u64..1000,
            gemma in any::<bool>(),
        ) {
            let arch = if gemma { Architecture::GemmaSmall } else { Architecture::Phi3Mini };
            let model = load(&SyntheticCheckpoint::random(arch, seed).unwrap());

            let full = model.forward_full(&tokens).unwrap();

            let mut cache = model.new_cache();
            let stepped: Vec<Tensor> = tokens
                .iter()
                .map(|&t| model.forward(&[t], &mut cache).unwrap())
                .collect();
            let stepped = Tensor::cat(&stepped, 1).unwrap();

            prop_assert_eq!(cache.seq_len(), tokens.len());
            prop_assert!(max_abs_diff(&full, &stepped) < 1e-4);
        }
    }
}
