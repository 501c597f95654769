//! Model loading and inference.
//!
//! Provides abstractions for decoder-only transformer models:
//! - Configuration parsing with per-architecture defaults
//! - Checkpoint loading, weight-name resolution and dequantization
//! - Attention, MLP and block primitives, composed into a [`Transformer`]
//! - The [`CausalLm`] contract and the [`ModelRegistry`] that dispatches
//!   on the detected [`Architecture`]
//! - Tokenizer bridge and chat prompt formatting

mod architecture;
mod attention;
mod config;
mod gemma;
mod golden;
mod kv_cache;
mod layer;
mod linear;
mod loader;
mod mlp;
mod norm;
mod phi3;
mod prompt;
mod registry;
mod resolver;
mod rope;
mod sentencepiece;
pub mod synthetic;
mod tokenizer;
mod transformer;

pub use architecture::Architecture;
pub use attention::{
    create_causal_mask, reconcile_width, repeat_kv, scaled_dot_product, Attention,
    AttentionConfig, QkvProjection,
};
pub use config::{ConfigDefaults, ModelConfig};
pub use gemma::GemmaLoader;
pub use golden::{GoldenCase, GoldenResult, GoldenSummary, GoldenTestHarness};
pub use kv_cache::{KvCache, LayerCache};
pub use layer::TransformerBlock;
pub use linear::Linear;
pub use loader::{checkpoint_files, WeightTable, SINGLE_FILE};
pub use mlp::{GateUpProjection, GatedMlp};
pub use norm::{LayerNorm, Norm, NormKind, RmsNorm};
pub use phi3::Phi3Loader;
pub use prompt::{ChatMessage, ChatTemplate, Phi3PromptBuilder};
pub use registry::{load_model, CausalLm, ModelLoader, ModelRegistry, CONFIG_FILE};
pub use resolver::{LayerPart, TensorRole, WeightResolver, AVAILABLE_SAMPLE_LIMIT};
pub use rope::{RopeStyle, RotaryEmbedding};
pub use sentencepiece::{
    encode_model_proto, Piece, PieceKind, SegmentationKind, SentencePieceModel,
    SENTENCEPIECE_FILE,
};
pub use synthetic::SyntheticCheckpoint;
pub use tokenizer::{
    PlaceholderTokenizer, Tokenizer, TokenizerBridge, TOKENIZER_CONFIG_FILE, TOKENIZER_FILE,
};
pub use transformer::{argmax, LmHead, ModelOptions, Transformer};
