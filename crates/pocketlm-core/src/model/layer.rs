//! Transformer decoder block.
//!
//! A single block combining:
//! - Pre-attention norm
//! - Grouped-query attention
//! - Post-attention norm
//! - Gated MLP
//!
//! `h = x + Attention(Norm₁(x))`, `out = h + MLP(Norm₂(h))`.
//!
//! The block holds no cache; the caller passes this layer's slot in.

use super::attention::reconcile_width;
use super::{
    Attention, AttentionConfig, GatedMlp, LayerCache, LayerPart, ModelConfig, Norm, NormKind,
    RotaryEmbedding, TensorRole, WeightResolver,
};
use crate::error::Result;
use candle_core::{Device, Tensor};

/// A single transformer decoder layer.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    /// Pre-attention norm.
    input_layernorm: Norm,
    /// Self-attention.
    attention: Attention,
    /// Post-attention norm.
    post_attention_layernorm: Norm,
    /// Feed-forward.
    mlp: GatedMlp,
    /// Residual stream width.
    hidden_size: usize,
    /// Layer index.
    layer_idx: usize,
}

impl TransformerBlock {
    /// Create a block from its parts.
    pub fn new(
        input_layernorm: Norm,
        attention: Attention,
        post_attention_layernorm: Norm,
        mlp: GatedMlp,
        hidden_size: usize,
        layer_idx: usize,
    ) -> Self {
        Self {
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
            hidden_size,
            layer_idx,
        }
    }

    /// Resolve every weight of layer `index`.
    pub fn load(
        resolver: &WeightResolver<'_>,
        index: usize,
        config: &ModelConfig,
        norm_kind: NormKind,
    ) -> Result<Self> {
        let norm = |part| {
            Norm::load(
                norm_kind,
                resolver,
                TensorRole::weight(index, part),
                TensorRole::bias(index, part),
                config.hidden_size,
                config.norm_eps,
            )
        };
        let input_layernorm = norm(LayerPart::InputNorm)?;
        let post_attention_layernorm = norm(LayerPart::PostAttentionNorm)?;

        let attention = Attention::load(
            resolver,
            index,
            AttentionConfig::new(
                config.num_attention_heads,
                config.num_key_value_heads,
                config.head_dim,
            ),
        )?;
        let mlp = GatedMlp::load(resolver, index)?;

        Ok(Self::new(
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
            config.hidden_size,
            index,
        ))
    }

    /// Create a transformer layer with random weights (for testing).
    pub fn random(
        config: &ModelConfig,
        norm_kind: NormKind,
        layer_idx: usize,
        device: &Device,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self::new(
            Norm::ones(norm_kind, hidden, config.norm_eps, device)?,
            Attention::random(
                hidden,
                AttentionConfig::new(
                    config.num_attention_heads,
                    config.num_key_value_heads,
                    config.head_dim,
                ),
                device,
            )?,
            Norm::ones(norm_kind, hidden, config.norm_eps, device)?,
            GatedMlp::random(hidden, config.intermediate_size, device)?,
            hidden,
            layer_idx,
        ))
    }

    /// Forward pass over `[batch, new_len, hidden]`, extending `cache`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        cache: &mut LayerCache,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn_output = self.attention.forward(&normed, rope, cache)?;
        let attn_output = reconcile_width(&attn_output, self.hidden_size, "attention residual")?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;
        let mlp_output = reconcile_width(&mlp_output, self.hidden_size, "mlp residual")?;
        Ok((hidden_states + mlp_output)?)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &GatedMlp {
        &self.mlp
    }
}
