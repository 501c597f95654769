//! # PocketLM Core
//!
//! On-device decoder engine for Gemma and Phi-3 family checkpoints.
//!
//! This crate provides:
//! - **Checkpoint loading** from single or sharded safetensors, with
//!   alias-based weight resolution and load-time dequantization
//! - **Transformer inference** with grouped-query attention, rotary
//!   position embeddings and an incrementally grown KV cache
//! - **Model registry** dispatching on the architecture in `config.json`
//! - **Generation** with greedy or seeded top-k sampling

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod generation;
pub mod model;
pub mod quantization;

pub use error::{PocketError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{PocketError, Result};
    pub use crate::generation::{generate, GenerationOutput, Generator, SamplingParams, StopReason};
    pub use crate::model::{
        load_model, Architecture, CausalLm, KvCache, ModelConfig, ModelRegistry, TokenizerBridge,
    };
}
