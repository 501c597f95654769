//! # PocketLM
//!
//! Run Gemma and Phi-3 family checkpoints locally.
//!
//! Point the engine at a checkpoint directory (`config.json`, safetensors
//! weights and, ideally, `tokenizer.json`); the architecture is detected
//! from the config and the matching loader builds the model.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pocketlm::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .model_path("models/phi-3-mini-4k-instruct")
//!         .build()
//!         .await?;
//!
//!     let result = engine
//!         .generate("Why is the sky blue?")
//!         .chat("You are a helpful assistant.")
//!         .max_tokens(64)
//!         .temperature(0.0)
//!         .execute()
//!         .await?;
//!
//!     println!("{}", result.text);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use pocketlm_core::*;

mod engine;

pub use engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult};
    pub use crate::{
        error::{PocketError, Result},
        generation::{SamplingParams, StopReason},
        model::{Architecture, CausalLm, KvCache, ModelConfig, ModelRegistry, TokenizerBridge},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tokio;
    pub use tracing;
}
