//! KV cache for transformer inference.
//!
//! Each layer keeps an optional `(key, value)` pair shaped
//! `[batch, num_kv_heads, seq_len, head_dim]`. Pairs start empty, grow by
//! concatenation along the sequence axis and never shrink. Keys are stored
//! before rotary embedding and before grouped-query replication.
//!
//! A cache belongs to exactly one generation session. Cloning is cheap
//! (tensors are reference counted) and is how a caller forks a session.

use crate::error::{PocketError, Result};
use candle_core::Tensor;

/// KV cache for a single layer.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    /// Cached keys: [batch, num_kv_heads, seq_len, head_dim]
    key: Option<Tensor>,
    /// Cached values: [batch, num_kv_heads, seq_len, head_dim]
    value: Option<Tensor>,
}

impl LayerCache {
    /// Create a new empty layer cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Get the current sequence length in cache.
    pub fn seq_len(&self) -> usize {
        self.key.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    /// Append new KV to cache and return concatenated KV.
    ///
    /// Returns (key, value) tensors that include all cached + new tokens.
    pub fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        if key.dims().len() != 4 || key.dims() != value.dims() {
            return Err(PocketError::ShapeMismatch(format!(
                "cache entries must be matching 4D tensors, got {:?} and {:?}",
                key.dims(),
                value.dims()
            )));
        }

        let (new_key, new_value) =
            if let (Some(cached_k), Some(cached_v)) = (&self.key, &self.value) {
                // Concatenate along sequence dimension (dim 2)
                let k = Tensor::cat(&[cached_k, key], 2)?;
                let v = Tensor::cat(&[cached_v, value], 2)?;
                (k, v)
            } else {
                (key.clone(), value.clone())
            };

        self.key = Some(new_key.clone());
        self.value = Some(new_value.clone());

        Ok((new_key, new_value))
    }

    /// Get cached KV without modification.
    pub fn get(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.key, &self.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    /// Clear the cache.
    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// Full KV cache for all layers.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Per-layer caches.
    layers: Vec<LayerCache>,
}

impl KvCache {
    /// Create a new KV cache for the given number of layers.
    pub fn new(num_layers: usize) -> Self {
        let layers = (0..num_layers).map(|_| LayerCache::new()).collect();
        Self { layers }
    }

    /// Get mutable reference to layer cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Result<&mut LayerCache> {
        let num_layers = self.layers.len();
        self.layers.get_mut(layer_idx).ok_or_else(|| {
            PocketError::Model(format!(
                "layer {} out of range for a {}-layer cache",
                layer_idx, num_layers
            ))
        })
    }

    /// Get reference to layer cache.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache> {
        self.layers.get(layer_idx)
    }

    /// Get the current sequence length (from first layer).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.seq_len()).unwrap_or(0)
    }

    /// Clear all layer caches.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.first().map(|l| l.is_empty()).unwrap_or(true)
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
