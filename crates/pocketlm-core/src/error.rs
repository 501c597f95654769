//! Error types for pocketlm.

use thiserror::Error;

/// Result type alias for pocketlm operations.
pub type Result<T> = std::result::Result<T, PocketError>;

/// Errors that can occur while loading or running a model.
#[derive(Error, Debug)]
pub enum PocketError {
    /// Hyperparameter document is malformed.
    #[error("config error: {0}")]
    Config(String),

    /// No alias for a required tensor role was present in the weight table.
    #[error(
        "missing tensor for {role}; tried [{}]; available (first {} sorted): [{}]",
        tried.join(", "),
        available.len(),
        available.join(", ")
    )]
    MissingTensor {
        /// Human readable role, e.g. "layer 3 query projection weight".
        role: String,
        /// Every physical name that was looked up, in order.
        tried: Vec<String>,
        /// Bounded, alphabetically sorted sample of names that do exist.
        available: Vec<String>,
    },

    /// A stage produced a tensor narrower than the next stage expects.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// No loader is registered for the detected architecture.
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// The real tokenizer could not be loaded.
    #[error("tokenizer unavailable: {0}")]
    TokenizerUnavailable(String),

    /// Model construction or file loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Generation loop error.
    #[error("generation error: {0}")]
    Generation(String),

    /// The model was unloaded and can no longer run steps.
    #[error("model has been unloaded")]
    Unloaded,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
