//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Position `p = start + local_index`, so a
//! continuation rotated with `start = cached_len` matches the tail of the
//! full sequence rotated from zero.
//!
//! Two pairing conventions exist in the wild:
//!
//! - [`RopeStyle::HalfSplit`]: coordinate `i` pairs with `i + d/2`
//!   (the `rotate_half` layout used by Hugging Face Llama/Gemma/Phi-3)
//! - [`RopeStyle::Interleaved`]: coordinate `2i` pairs with `2i + 1`
//!   (RoFormer / GPT-J layout)
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{PocketError, Result};
use candle_core::{Device, Tensor};

/// Coordinate pairing convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RopeStyle {
    /// Pair first half with second half.
    #[default]
    HalfSplit,
    /// Pair adjacent even/odd coordinates.
    Interleaved,
}

/// Rotary Position Embedding implementation.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Inverse frequencies `[1, head_dim / 2]`.
    inv_freq: Tensor,
    /// Cosine cache for positions.
    cos_cache: Tensor,
    /// Sine cache for positions.
    sin_cache: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Maximum sequence length cached.
    max_seq_len: usize,
    style: RopeStyle,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head (must be even)
    /// * `max_seq_len` - Number of positions to precompute
    /// * `theta` - Base frequency (10000 for Phi-3, 1e6 for Gemma-3)
    /// * `style` - Pairing convention
    /// * `device` - Device for tensors
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        theta: f64,
        style: RopeStyle,
        device: &Device,
    ) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(PocketError::ShapeMismatch(format!(
                "RoPE requires an even head dimension, got {}",
                head_dim
            )));
        }

        // theta^(-2i/d) for i in [0, d/2)
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| theta.powf(-2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let (cos_cache, sin_cache) = Self::angles(&inv_freq, 0, max_seq_len.max(1), device)?;

        Ok(Self {
            inv_freq,
            cos_cache,
            sin_cache,
            head_dim,
            max_seq_len: max_seq_len.max(1),
            style,
        })
    }

    /// cos/sin of `position * inv_freq` for `len` positions from `start`.
    fn angles(inv_freq: &Tensor, start: usize, len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let positions: Vec<f32> = (start..start + len).map(|p| p as f32).collect();
        let positions = Tensor::from_slice(&positions, (len, 1), device)?;
        // [len, 1] x [1, half] -> [len, half]
        let freqs = positions.matmul(inv_freq)?;
        Ok((freqs.cos()?, freqs.sin()?))
    }

    fn cos_sin(&self, start: usize, len: usize) -> Result<(Tensor, Tensor)> {
        if start + len <= self.max_seq_len {
            Ok((
                self.cos_cache.narrow(0, start, len)?,
                self.sin_cache.narrow(0, start, len)?,
            ))
        } else {
            Self::angles(&self.inv_freq, start, len, self.inv_freq.device())
        }
    }

    /// Rotate one `[batch, heads, seq_len, head_dim]` tensor whose first
    /// token sits at absolute position `start`.
    pub fn apply_one(&self, x: &Tensor, start: usize) -> Result<Tensor> {
        let dims = x.dims();
        if dims.len() != 4 || dims[3] != self.head_dim {
            return Err(PocketError::ShapeMismatch(format!(
                "RoPE expects [batch, heads, seq, {}], got {:?}",
                self.head_dim, dims
            )));
        }
        let seq_len = dims[2];
        if seq_len == 0 {
            return Ok(x.clone());
        }
        let (cos, sin) = self.cos_sin(start, seq_len)?;
        match self.style {
            RopeStyle::HalfSplit => self.rotate_half(x, &cos, &sin),
            RopeStyle::Interleaved => self.rotate_interleaved(x, &cos, &sin),
        }
    }

    /// Apply rotary embeddings to query and key tensors at the same start.
    ///
    /// # Arguments
    ///
    /// * `query` - Query tensor [batch, num_heads, seq_len, head_dim]
    /// * `key` - Key tensor [batch, num_kv_heads, seq_len, head_dim]
    /// * `start` - Absolute position of the first token
    pub fn apply(&self, query: &Tensor, key: &Tensor, start: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.apply_one(query, start)?, self.apply_one(key, start)?))
    }

    /// `[x1, x2] -> [x1*cos - x2*sin, x1*sin + x2*cos]` on the two halves.
    fn rotate_half(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let half_dim = self.head_dim / 2;
        let x1 = x.narrow(3, 0, half_dim)?;
        let x2 = x.narrow(3, half_dim, half_dim)?;

        // [seq, half] broadcasts against [batch, heads, seq, half]
        let out1 = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
        let out2 = (x1.broadcast_mul(sin)? + x2.broadcast_mul(cos)?)?;

        Ok(Tensor::cat(&[out1, out2], 3)?)
    }

    /// Same rotation on adjacent `(2i, 2i+1)` pairs.
    fn rotate_interleaved(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (b, h, s, d) = x.dims4()?;
        let half_dim = d / 2;
        let pairs = x.reshape((b, h, s, half_dim, 2))?;
        let x1 = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let x2 = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        let out1 = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
        let out2 = (x1.broadcast_mul(sin)? + x2.broadcast_mul(cos)?)?;

        Ok(Tensor::stack(&[out1, out2], 4)?.reshape((b, h, s, d))?)
    }

    /// Get the number of precomputed positions.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Pairing convention.
    pub fn style(&self) -> RopeStyle {
        self.style
    }
}
