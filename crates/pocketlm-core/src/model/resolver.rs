//! Tensor role resolution.
//!
//! Checkpoints exported by different tools name the same tensor
//! differently (`model.layers.0.self_attn.q_proj.weight` versus
//! `layers.0.attention.wq.weight`). Every submodule constructor asks the
//! [`WeightResolver`] for a logical [`TensorRole`]; the alias lists below
//! are the only place physical names are spelled out.
//!
//! Within each list the Hugging Face spelling comes first and the
//! Meta/GGML-style spelling last. The first alias present wins.

use super::WeightTable;
use crate::error::{PocketError, Result};
use candle_core::Tensor;
use std::fmt;

/// Upper bound on the number of available names quoted in a
/// [`PocketError::MissingTensor`].
pub const AVAILABLE_SAMPLE_LIMIT: usize = 150;

/// A per-layer tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerPart {
    /// Query projection.
    Query,
    /// Key projection.
    Key,
    /// Value projection.
    Value,
    /// Attention output projection.
    Output,
    /// Fused query/key/value projection.
    FusedQkv,
    /// MLP gate projection.
    Gate,
    /// MLP up projection.
    Up,
    /// MLP down projection.
    Down,
    /// Fused gate/up projection.
    FusedGateUp,
    /// Pre-attention norm.
    InputNorm,
    /// Pre-MLP norm.
    PostAttentionNorm,
}

impl LayerPart {
    /// Every per-layer part.
    pub const ALL: [LayerPart; 11] = [
        LayerPart::Query,
        LayerPart::Key,
        LayerPart::Value,
        LayerPart::Output,
        LayerPart::FusedQkv,
        LayerPart::Gate,
        LayerPart::Up,
        LayerPart::Down,
        LayerPart::FusedGateUp,
        LayerPart::InputNorm,
        LayerPart::PostAttentionNorm,
    ];

    /// Name stems with a `{i}` layer placeholder.
    fn stems(&self) -> &'static [&'static str] {
        match self {
            Self::Query => &[
                "model.layers.{i}.attention.query",
                "model.layers.{i}.self_attn.q_proj",
                "layers.{i}.attention.wq",
            ],
            Self::Key => &[
                "model.layers.{i}.attention.key",
                "model.layers.{i}.self_attn.k_proj",
                "layers.{i}.attention.wk",
            ],
            Self::Value => &[
                "model.layers.{i}.attention.value",
                "model.layers.{i}.self_attn.v_proj",
                "layers.{i}.attention.wv",
            ],
            Self::Output => &[
                "model.layers.{i}.attention.output",
                "model.layers.{i}.self_attn.o_proj",
                "layers.{i}.attention.wo",
            ],
            Self::FusedQkv => &[
                "model.layers.{i}.self_attn.qkv_proj",
                "layers.{i}.attention.wqkv",
            ],
            Self::Gate => &[
                "model.layers.{i}.mlp.gate_proj",
                "layers.{i}.feed_forward.w1",
            ],
            Self::Up => &["model.layers.{i}.mlp.up_proj", "layers.{i}.feed_forward.w3"],
            Self::Down => &[
                "model.layers.{i}.mlp.down_proj",
                "layers.{i}.feed_forward.w2",
            ],
            Self::FusedGateUp => &[
                "model.layers.{i}.mlp.gate_up_proj",
                "layers.{i}.mlp.gate_up_proj",
            ],
            Self::InputNorm => &[
                "model.layers.{i}.input_layernorm",
                "layers.{i}.attention_norm",
            ],
            Self::PostAttentionNorm => &[
                "model.layers.{i}.post_attention_layernorm",
                "layers.{i}.ffn_norm",
            ],
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Query => "query projection",
            Self::Key => "key projection",
            Self::Value => "value projection",
            Self::Output => "attention output projection",
            Self::FusedQkv => "fused qkv projection",
            Self::Gate => "mlp gate projection",
            Self::Up => "mlp up projection",
            Self::Down => "mlp down projection",
            Self::FusedGateUp => "fused gate/up projection",
            Self::InputNorm => "input norm",
            Self::PostAttentionNorm => "post-attention norm",
        }
    }
}

/// Logical identity of a tensor, independent of checkpoint naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    /// Token embedding table `[vocab, width]`.
    Embedding,
    /// Projection from embedding width to hidden width.
    EmbeddingProjection,
    /// Final norm before the output head.
    FinalNorm {
        /// Bias instead of weight.
        bias: bool,
    },
    /// Explicit output head `[vocab, hidden]`.
    LmHead {
        /// Bias instead of weight.
        bias: bool,
    },
    /// A tensor inside transformer layer `index`.
    Layer {
        /// Layer index.
        index: usize,
        /// Which tensor of the layer.
        part: LayerPart,
        /// Bias instead of weight.
        bias: bool,
    },
}

impl TensorRole {
    /// Weight of a layer part.
    pub fn weight(index: usize, part: LayerPart) -> Self {
        Self::Layer {
            index,
            part,
            bias: false,
        }
    }

    /// Bias of a layer part.
    pub fn bias(index: usize, part: LayerPart) -> Self {
        Self::Layer {
            index,
            part,
            bias: true,
        }
    }

    /// Physical names to try, in order.
    pub fn aliases(&self) -> Vec<String> {
        let (stems, index, bias): (&[&str], Option<usize>, bool) = match *self {
            Self::Embedding => (
                &["model.embed_tokens", "embed_tokens", "tok_embeddings"],
                None,
                false,
            ),
            Self::EmbeddingProjection => (&["model.embed_proj", "embed_proj"], None, false),
            Self::FinalNorm { bias } => (&["model.norm", "norm", "output_norm"], None, bias),
            Self::LmHead { bias } => (
                &["lm_head", "model.lm_head", "model.output", "output"],
                None,
                bias,
            ),
            Self::Layer { index, part, bias } => (part.stems(), Some(index), bias),
        };
        let suffix = if bias { "bias" } else { "weight" };
        stems
            .iter()
            .map(|stem| {
                let stem = match index {
                    Some(i) => stem.replace("{i}", &i.to_string()),
                    None => stem.to_string(),
                };
                format!("{}.{}", stem, suffix)
            })
            .collect()
    }

    /// Every role of a model with `num_layers` layers.
    pub fn catalog(num_layers: usize) -> Vec<TensorRole> {
        let mut roles = vec![
            Self::Embedding,
            Self::EmbeddingProjection,
            Self::FinalNorm { bias: false },
            Self::FinalNorm { bias: true },
            Self::LmHead { bias: false },
            Self::LmHead { bias: true },
        ];
        for index in 0..num_layers {
            for part in LayerPart::ALL {
                roles.push(Self::weight(index, part));
                roles.push(Self::bias(index, part));
            }
        }
        roles
    }
}

impl fmt::Display for TensorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = |bias: bool| if bias { "bias" } else { "weight" };
        match self {
            Self::Embedding => write!(f, "embedding weight"),
            Self::EmbeddingProjection => write!(f, "embedding projection weight"),
            Self::FinalNorm { bias } => write!(f, "final norm {}", kind(*bias)),
            Self::LmHead { bias } => write!(f, "lm head {}", kind(*bias)),
            Self::Layer { index, part, bias } => {
                write!(f, "layer {} {} {}", index, part.label(), kind(*bias))
            }
        }
    }
}

/// Looks up tensors by role in a read-only [`WeightTable`].
#[derive(Debug, Clone, Copy)]
pub struct WeightResolver<'a> {
    table: &'a WeightTable,
}

impl<'a> WeightResolver<'a> {
    /// Create a resolver over a weight table.
    pub fn new(table: &'a WeightTable) -> Self {
        Self { table }
    }

    /// Underlying table.
    pub fn table(&self) -> &'a WeightTable {
        self.table
    }

    /// First present alias and its tensor.
    pub fn find(&self, role: TensorRole) -> Option<(String, Tensor)> {
        role.aliases()
            .into_iter()
            .find_map(|name| self.table.get(&name).cloned().map(|t| (name, t)))
    }

    /// Resolve a required tensor.
    pub fn resolve(&self, role: TensorRole) -> Result<Tensor> {
        match self.find(role) {
            Some((_, tensor)) => Ok(tensor),
            None => Err(self.missing(role)),
        }
    }

    /// Resolve an optional tensor (biases, tied heads).
    pub fn resolve_optional(&self, role: TensorRole) -> Option<Tensor> {
        self.find(role).map(|(_, t)| t)
    }

    /// Whether any alias of the role is present.
    pub fn has(&self, role: TensorRole) -> bool {
        role.aliases().iter().any(|name| self.table.contains(name))
    }

    /// Build the diagnostic error for a role with no present alias.
    pub fn missing(&self, role: TensorRole) -> PocketError {
        let available = self
            .table
            .sorted_names()
            .into_iter()
            .take(AVAILABLE_SAMPLE_LIMIT)
            .map(str::to_string)
            .collect();
        PocketError::MissingTensor {
            role: role.to_string(),
            tried: role.aliases(),
            available,
        }
    }
}
