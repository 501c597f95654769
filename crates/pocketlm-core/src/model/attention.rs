//! Grouped-query self-attention with an explicit per-layer cache.
//!
//! Per step:
//! 1. project hidden states to Q, K, V and split heads
//! 2. append the new (un-rotated) K, V to the layer cache
//! 3. rotate Q from `cached_len` and the full K from position 0
//! 4. replicate K/V heads so every query head has a partner
//! 5. scaled dot-product with an additive causal mask sized `[new, total]`
//! 6. merge heads, reconcile width, output projection

use super::{LayerCache, LayerPart, Linear, RotaryEmbedding, TensorRole, WeightResolver};
use crate::error::{PocketError, Result};
use candle_core::{Device, Tensor, D};
use tracing::warn;

/// Head layout of an attention module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionConfig {
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of key/value heads.
    pub num_kv_heads: usize,
    /// Per-head width.
    pub head_dim: usize,
}

impl AttentionConfig {
    /// Create a head layout.
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_dim,
        }
    }

    /// Query heads per KV head.
    pub fn gqa_ratio(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Width of all query heads.
    pub fn q_width(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Width of all key (or value) heads.
    pub fn kv_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

/// Physical layout of the input projections.
#[derive(Debug, Clone)]
pub enum QkvProjection {
    /// Three separate matrices.
    Separate {
        /// Query projection.
        q: Linear,
        /// Key projection.
        k: Linear,
        /// Value projection.
        v: Linear,
    },
    /// One matrix whose output rows are `[q | k | v]`.
    Fused(Linear),
}

/// Self-attention module for transformer layers.
#[derive(Debug, Clone)]
pub struct Attention {
    qkv: QkvProjection,
    o_proj: Linear,
    config: AttentionConfig,
}

impl Attention {
    /// Create attention from projections.
    pub fn new(qkv: QkvProjection, o_proj: Linear, config: AttentionConfig) -> Result<Self> {
        if config.num_kv_heads == 0 || config.num_heads % config.num_kv_heads != 0 {
            return Err(PocketError::ShapeMismatch(format!(
                "{} query heads cannot be grouped over {} kv heads",
                config.num_heads, config.num_kv_heads
            )));
        }
        let expect = |name: &str, got: usize, want: usize| -> Result<()> {
            if got != want {
                return Err(PocketError::ShapeMismatch(format!(
                    "{} projection has {} outputs, expected {}",
                    name, got, want
                )));
            }
            Ok(())
        };
        match &qkv {
            QkvProjection::Separate { q, k, v } => {
                expect("query", q.out_features(), config.q_width())?;
                expect("key", k.out_features(), config.kv_width())?;
                expect("value", v.out_features(), config.kv_width())?;
            }
            QkvProjection::Fused(w) => {
                expect(
                    "fused qkv",
                    w.out_features(),
                    config.q_width() + 2 * config.kv_width(),
                )?;
            }
        }
        Ok(Self {
            qkv,
            o_proj,
            config,
        })
    }

    /// Resolve the projections of layer `index`.
    ///
    /// A fused `qkv_proj` is used when present, separate Q/K/V otherwise.
    pub fn load(resolver: &WeightResolver<'_>, index: usize, config: AttentionConfig) -> Result<Self> {
        let fused = TensorRole::weight(index, LayerPart::FusedQkv);
        let qkv = if resolver.has(fused) {
            QkvProjection::Fused(Linear::load(
                resolver,
                fused,
                TensorRole::bias(index, LayerPart::FusedQkv),
            )?)
        } else {
            let load = |part| {
                Linear::load(
                    resolver,
                    TensorRole::weight(index, part),
                    TensorRole::bias(index, part),
                )
            };
            QkvProjection::Separate {
                q: load(LayerPart::Query)?,
                k: load(LayerPart::Key)?,
                v: load(LayerPart::Value)?,
            }
        };
        let o_proj = Linear::load(
            resolver,
            TensorRole::weight(index, LayerPart::Output),
            TensorRole::bias(index, LayerPart::Output),
        )?;
        Self::new(qkv, o_proj, config)
    }

    /// Create attention with random weights (for testing).
    pub fn random(hidden_size: usize, config: AttentionConfig, device: &Device) -> Result<Self> {
        let qkv = QkvProjection::Separate {
            q: Linear::random(hidden_size, config.q_width(), device)?,
            k: Linear::random(hidden_size, config.kv_width(), device)?,
            v: Linear::random(hidden_size, config.kv_width(), device)?,
        };
        let o_proj = Linear::random(config.q_width(), hidden_size, device)?;
        Self::new(qkv, o_proj, config)
    }

    /// Project hidden states to heads.
    ///
    /// Returns (query, key, value) tensors reshaped for attention:
    /// - query: [batch, num_heads, seq_len, head_dim]
    /// - key: [batch, num_kv_heads, seq_len, head_dim]
    /// - value: [batch, num_kv_heads, seq_len, head_dim]
    pub fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, _) = x.dims3()?;
        let cfg = self.config;

        let (q, k, v) = match &self.qkv {
            QkvProjection::Separate { q, k, v } => (q.forward(x)?, k.forward(x)?, v.forward(x)?),
            QkvProjection::Fused(w) => {
                let qkv = w.forward(x)?;
                let q = qkv.narrow(D::Minus1, 0, cfg.q_width())?;
                let k = qkv.narrow(D::Minus1, cfg.q_width(), cfg.kv_width())?;
                let v = qkv.narrow(D::Minus1, cfg.q_width() + cfg.kv_width(), cfg.kv_width())?;
                (q, k, v)
            }
        };

        let split = |t: Tensor, heads: usize| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, heads, cfg.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        Ok((
            split(q, cfg.num_heads)?,
            split(k, cfg.num_kv_heads)?,
            split(v, cfg.num_kv_heads)?,
        ))
    }

    /// Run attention for the new tokens in `hidden`, extending `cache`.
    ///
    /// `hidden` is `[batch, new_len, hidden]`; returns `[batch, new_len, hidden]`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        rope: &RotaryEmbedding,
        cache: &mut LayerCache,
    ) -> Result<Tensor> {
        let (_, new_len, _) = hidden.dims3()?;
        let (q, k, v) = self.project(hidden)?;

        let past = cache.seq_len();
        let (full_k, full_v) = cache.append(&k, &v)?;

        let q = rope.apply_one(&q, past)?;
        let full_k = rope.apply_one(&full_k, 0)?;

        let ratio = self.config.gqa_ratio();
        let full_k = repeat_kv(&full_k, ratio)?;
        let full_v = repeat_kv(&full_v, ratio)?;

        let mask = if new_len > 1 {
            Some(create_causal_mask(new_len, past + new_len, hidden.device())?)
        } else {
            None
        };
        let attn = scaled_dot_product(&q, &full_k, &full_v, mask.as_ref())?;

        self.output(&attn)
    }

    /// Merge heads and apply the output projection.
    ///
    /// Input: [batch, num_heads, seq_len, head_dim]
    /// Output: [batch, seq_len, hidden_size]
    pub fn output(&self, attn_output: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = attn_output.dims4()?;
        let merged = attn_output
            .transpose(1, 2)?
            .reshape((batch, seq_len, heads * head_dim))?;
        let merged = reconcile_width(&merged, self.o_proj.in_features(), "attention output")?;
        self.o_proj.forward(&merged)
    }

    /// Head layout.
    pub fn config(&self) -> AttentionConfig {
        self.config
    }

    /// Whether the projections are fused.
    pub fn is_fused(&self) -> bool {
        matches!(self.qkv, QkvProjection::Fused(_))
    }
}

/// Fit the last dimension of `x` to `expected`.
///
/// Wider tensors are truncated with a warning; narrower ones are a
/// [`PocketError::ShapeMismatch`]. Nothing is ever padded.
pub fn reconcile_width(x: &Tensor, expected: usize, stage: &str) -> Result<Tensor> {
    let width = x.dims().last().copied().unwrap_or(0);
    if width == expected {
        return Ok(x.clone());
    }
    if width < expected {
        return Err(PocketError::ShapeMismatch(format!(
            "{} width {} is smaller than expected {}",
            stage, width, expected
        )));
    }
    warn!(stage, width, expected, "truncating oversized activation");
    Ok(x.narrow(D::Minus1, 0, expected)?)
}

/// Softmax attention `softmax((Q·scale)·Kᵗ + mask)·V` with `scale = 1/√d`.
pub fn scaled_dot_product(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let head_dim = q.dims().last().copied().unwrap_or(1) as f64;
    let scale = 1.0 / head_dim.sqrt();

    let scores = (q * scale)?.matmul(&k.t()?)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(mask)?,
        None => scores,
    };
    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    Ok(weights.matmul(v)?)
}

/// Repeat KV heads for GQA.
///
/// KV head `j` becomes query heads `j*repeat .. (j+1)*repeat`, so query
/// head `h` reads KV head `h / repeat`.
pub fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [b, kv, s, d] -> [b, kv, 1, s, d] -> [b, kv, repeat, s, d] -> [b, kv*repeat, s, d]
    let x = x
        .unsqueeze(2)?
        .expand((batch, num_kv_heads, repeat, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?;
    Ok(x)
}

/// Additive causal mask `[1, 1, new_len, total_len]`.
///
/// Query `i` (absolute position `total_len - new_len + i`) may see keys
/// `0..=total_len - new_len + i`; later keys get `-inf`.
pub fn create_causal_mask(new_len: usize, total_len: usize, device: &Device) -> Result<Tensor> {
    if new_len > total_len {
        return Err(PocketError::ShapeMismatch(format!(
            "mask for {} new tokens over {} total",
            new_len, total_len
        )));
    }
    let past = total_len - new_len;
    let mask: Vec<f32> = (0..new_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| if j > past + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    let mask = Tensor::from_slice(&mask, (new_len, total_len), device)?;
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RopeStyle;
    use candle_core::DType;

    fn rope(head_dim: usize) -> RotaryEmbedding {
        RotaryEmbedding::new(head_dim, 64, 10000.0, RopeStyle::HalfSplit, &Device::Cpu).unwrap()
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
    fn attention_projection_shapes() {
        let attn = Attention::random(256, AttentionConfig::new(4, 2, 64), &Device::Cpu).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, &[2, 8, 256], &Device::Cpu).unwrap();
        let (q, k, v) = attn.project(&x).unwrap();

        assert_eq!(q.dims(), &[2, 4, 8, 64]);
        assert_eq!(k.dims(), &[2, 2, 8, 64]);
        assert_eq!(v.dims(), &[2, 2, 8, 64]);
    }

    #[test]
    fn fused_projection_matches_separate() {
        let cfg = AttentionConfig::new(4, 2, 8);
        let hidden = 32;
        let separate = Attention::random(hidden, cfg, &Device::Cpu).unwrap();
        let (q, k, v) = match &separate.qkv {
            QkvProjection::Separate { q, k, v } => (q, k, v),
            QkvProjection::Fused(_) => unreachable!(),
        };
        let fused_w = Tensor::cat(&[q.weight(), k.weight(), v.weight()], 0).unwrap();
        let fused = Attention::new(
            QkvProjection::Fused(Linear::new(fused_w, None).unwrap()),
            separate.o_proj.clone(),
            cfg,
        )
        .unwrap();
        assert!(fused.is_fused());

        let x = Tensor::randn(0.0f32, 1.0, &[1, 5, hidden], &Device::Cpu).unwrap();
        let a = separate.forward(&x, &rope(8), &mut LayerCache::new()).unwrap();
        let b = fused.forward(&x, &rope(8), &mut LayerCache::new()).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn wrong_projection_width_rejected() {
        let cfg = AttentionConfig::new(4, 2, 8);
        let q = Linear::random(32, 30, &Device::Cpu).unwrap();
        let k = Linear::random(32, 16, &Device::Cpu).unwrap();
        let v = Linear::random(32, 16, &Device::Cpu).unwrap();
        let o = Linear::random(32, 32, &Device::Cpu).unwrap();
        let err = Attention::new(QkvProjection::Separate { q, k, v }, o, cfg).unwrap_err();
        assert!(matches!(err, PocketError::ShapeMismatch(_)));
    }

    #[test]
    fn causal_mask_shape_and_values() {
        let mask = create_causal_mask(4, 4, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);
        let vals: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert!(vals[0][0].is_finite());
        assert!(vals[0][1].is_infinite());
        assert!(vals[3].iter().all(|v| v.is_finite()));
    }

    #[test]
    fn causal_mask_with_cached_prefix() {
        // 2 new tokens after 3 cached: [2, 5]
        let mask = create_causal_mask(2, 5, &Device::Cpu).unwrap();
        let vals: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(vals.len(), 2);
        assert!(vals[0][..4].iter().all(|v| *v == 0.0));
        assert!(vals[0][4].is_infinite());
        assert!(vals[1].iter().all(|v| *v == 0.0));
        assert!(create_causal_mask(3, 2, &Device::Cpu).is_err());
    }

    #[test]
    fn repeat_kv_expansion() {
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 4, 8], &Device::Cpu).unwrap();
        let repeated = repeat_kv(&x, 3).unwrap();
        assert_eq!(repeated.dims(), &[1, 6, 4, 8]);
        for h in 0..6 {
            let a = repeated.narrow(1, h, 1).unwrap();
            let b = x.narrow(1, h / 3, 1).unwrap();
            assert!(max_abs_diff(&a, &b) == 0.0);
        }
        assert_eq!(repeat_kv(&x, 1).unwrap().dims(), x.dims());
    }

    #[test]
    fn gqa_matches_per_head_reference() {
        let (heads, kv_heads, d, s) = (6, 2, 8, 5);
        let q = Tensor::randn(0.0f32, 1.0, &[1, heads, s, d], &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, &[1, kv_heads, s, d], &Device::Cpu).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, &[1, kv_heads, s, d], &Device::Cpu).unwrap();
        let mask = create_causal_mask(s, s, &Device::Cpu).unwrap();

        let ratio = heads / kv_heads;
        let replicated = scaled_dot_product(
            &q,
            &repeat_kv(&k, ratio).unwrap(),
            &repeat_kv(&v, ratio).unwrap(),
            Some(&mask),
        )
        .unwrap();

        for h in 0..heads {
            let qh = q.narrow(1, h, 1).unwrap();
            let kh = k.narrow(1, h / ratio, 1).unwrap();
            let vh = v.narrow(1, h / ratio, 1).unwrap();
            let direct = scaled_dot_product(&qh, &kh, &vh, Some(&mask)).unwrap();
            let from_group = replicated.narrow(1, h, 1).unwrap();
            assert!(max_abs_diff(&direct, &from_group) < 1e-5);
        }
    }

    #[test]
    fn incremental_matches_full_pass() {
        let attn = Attention::random(32, AttentionConfig::new(4, 2, 8), &Device::Cpu).unwrap();
        let rope = rope(8);
        let x = Tensor::randn(0.0f32, 1.0, &[1, 6, 32], &Device::Cpu).unwrap();

        let full = attn.forward(&x, &rope, &mut LayerCache::new()).unwrap();

        let mut cache = LayerCache::new();
        let first = attn.forward(&x.narrow(1, 0, 4).unwrap(), &rope, &mut cache).unwrap();
        let mut pieces = vec![first];
        for t in 4..6 {
            pieces.push(attn.forward(&x.narrow(1, t, 1).unwrap(), &rope, &mut cache).unwrap());
        }
        let stepped = Tensor::cat(&pieces, 1).unwrap();

        assert_eq!(cache.seq_len(), 6);
        assert!(max_abs_diff(&full, &stepped) < 1e-5);
    }

    #[test]
    fn reconcile_truncates_one_wider() {
        let x = Tensor::arange(0f32, 9.0, &Device::Cpu).unwrap().reshape((1, 1, 9)).unwrap();
        let y = reconcile_width(&x, 8, "test").unwrap();
        assert_eq!(y.dims(), &[1, 1, 8]);
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(vals, (0..8).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn reconcile_rejects_one_narrower() {
        let x = Tensor::zeros((1, 1, 7), DType::F32, &Device::Cpu).unwrap();
        let err = reconcile_width(&x, 8, "test").unwrap_err();
        assert!(matches!(err, PocketError::ShapeMismatch(_)));
    }

    #[test]
    fn output_projection_truncates_wider_heads() {
        // 2 heads x 5 = 10 wide, o_proj expects 9
        let cfg = AttentionConfig::new(2, 2, 5);
        let qkv = QkvProjection::Separate {
            q: Linear::random(9, 10, &Device::Cpu).unwrap(),
            k: Linear::random(9, 10, &Device::Cpu).unwrap(),
            v: Linear::random(9, 10, &Device::Cpu).unwrap(),
        };
        let attn = Attention::new(qkv, Linear::random(9, 9, &Device::Cpu).unwrap(), cfg).unwrap();
        let heads = Tensor::randn(0.0f32, 1.0, &[1, 2, 3, 5], &Device::Cpu).unwrap();
        assert_eq!(attn.output(&heads).unwrap().dims(), &[1, 3, 9]);

        // o_proj expecting 11 cannot be satisfied
        let qkv = QkvProjection::Separate {
            q: Linear::random(11, 10, &Device::Cpu).unwrap(),
            k: Linear::random(11, 10, &Device::Cpu).unwrap(),
            v: Linear::random(11, 10, &Device::Cpu).unwrap(),
        };
        let attn = Attention::new(qkv, Linear::random(11, 11, &Device::Cpu).unwrap(), cfg).unwrap();
        assert!(matches!(attn.output(&heads), Err(PocketError::ShapeMismatch(_))));
    }
}
