//! Layer normalization variants.
//!
//! Two variants are needed because the supported families disagree:
//!
//! - **RMSNorm** (Phi-3): `x * weight / sqrt(mean(x^2) + eps)`
//! - **LayerNorm** (Gemma): `(x - mean) / sqrt(var + eps) * weight + bias`
//!
//! The variant is fixed when a [`Norm`] is constructed.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use super::{TensorRole, WeightResolver};
use crate::error::{PocketError, Result};
use candle_core::{DType, Device, Tensor, D};

/// Which normalization an architecture uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Root-mean-square, no centering, no bias.
    Rms,
    /// Mean-centred, optional affine bias.
    Layer,
}

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Ok(Self { weight, eps })
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let normalized = x.broadcast_mul(&rsqrt)?;
        Ok(normalized.broadcast_mul(&self.weight)?)
    }
}

/// Mean-centred layer normalization.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    eps: f64,
}

impl LayerNorm {
    /// Create with optional affine parameters.
    pub fn new(weight: Option<Tensor>, bias: Option<Tensor>, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let rstd = (var + self.eps)?.sqrt()?.recip()?;
        let mut out = centered.broadcast_mul(&rstd)?;
        if let Some(w) = &self.weight {
            out = out.broadcast_mul(w)?;
        }
        if let Some(b) = &self.bias {
            out = out.broadcast_add(b)?;
        }
        Ok(out)
    }
}

/// Architecture-selected normalization.
#[derive(Debug, Clone)]
pub enum Norm {
    /// RMSNorm.
    Rms(RmsNorm),
    /// LayerNorm.
    Layer(LayerNorm),
}

impl Norm {
    /// Build a norm of the given kind from resolved tensors.
    ///
    /// The weight must have exactly `hidden_size` elements; a bias is only
    /// used by [`NormKind::Layer`].
    pub fn load(
        kind: NormKind,
        resolver: &WeightResolver<'_>,
        weight: TensorRole,
        bias: TensorRole,
        hidden_size: usize,
        eps: f64,
    ) -> Result<Self> {
        let w = resolver.resolve(weight)?;
        check_len(&w, hidden_size, weight)?;
        Ok(match kind {
            NormKind::Rms => Norm::Rms(RmsNorm::new(w, eps)),
            NormKind::Layer => {
                let b = resolver.resolve_optional(bias);
                if let Some(b) = &b {
                    check_len(b, hidden_size, bias)?;
                }
                Norm::Layer(LayerNorm::new(Some(w), b, eps))
            }
        })
    }

    /// Identity-weighted norm (for testing).
    pub fn ones(kind: NormKind, hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        Ok(match kind {
            NormKind::Rms => Norm::Rms(RmsNorm::ones(hidden_size, eps, device)?),
            NormKind::Layer => Norm::Layer(LayerNorm::new(
                Some(Tensor::ones(hidden_size, DType::F32, device)?),
                None,
                eps,
            )),
        })
    }

    /// Forward pass.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Norm::Rms(n) => n.forward(x),
            Norm::Layer(n) => n.forward(x),
        }
    }

    /// Variant of this norm.
    pub fn kind(&self) -> NormKind {
        match self {
            Norm::Rms(_) => NormKind::Rms,
            Norm::Layer(_) => NormKind::Layer,
        }
    }
}

fn check_len(t: &Tensor, expected: usize, role: TensorRole) -> Result<()> {
    if t.elem_count() != expected {
        return Err(PocketError::ShapeMismatch(format!(
            "{}: expected {} elements, got {:?}",
            role,
            expected,
            t.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WeightTable;
    use std::collections::HashMap;

    #[test]
    fn rmsnorm_forward_3d() {
        let norm = RmsNorm::ones(64, 1e-5, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 64], &Device::Cpu).unwrap();
        let output = norm.forward(&x).unwrap();
        assert_eq!(output.dims(), x.dims());
    }

    #[test]
    fn rmsnorm_normalized_magnitude() {
        let norm = RmsNorm::ones(64, 1e-5, &Device::Cpu).unwrap();

        // All values = 2.0, so RMS = 2.0 and the output is ~1.0
        let x = (Tensor::ones(&[1, 64], DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
        let output = norm.forward(&x).unwrap();

        let output_vec: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for val in output_vec {
            assert!((val - 1.0).abs() < 1e-4, "Expected ~1.0, got {}", val);
        }
    }

    #[test]
    fn layernorm_centers_and_scales() {
        let ln = LayerNorm::new(
            Some(Tensor::new(&[2.0f32, 2.0], &Device::Cpu).unwrap()),
            Some(Tensor::new(&[1.0f32, 1.0], &Device::Cpu).unwrap()),
            0.0,
        );
        let x = Tensor::new(&[[3.0f32, 5.0]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = ln.forward(&x).unwrap().to_vec2().unwrap();
        // mean 4, std 1 -> [-1, 1] * 2 + 1
        assert!((out[0][0] + 1.0).abs() < 1e-5);
        assert!((out[0][1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn layernorm_without_affine() {
        let ln = LayerNorm::new(None, None, 1e-6);
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let out: Vec<f32> = ln.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn variants_differ_on_offset_input() {
        let x = Tensor::new(&[[1.0f32, 3.0]], &Device::Cpu).unwrap();
        let rms = Norm::ones(NormKind::Rms, 2, 1e-6, &Device::Cpu).unwrap();
        let ln = Norm::ones(NormKind::Layer, 2, 1e-6, &Device::Cpu).unwrap();
        let a: Vec<Vec<f32>> = rms.forward(&x).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = ln.forward(&x).unwrap().to_vec2().unwrap();
        assert!(a[0][0] > 0.0);
        assert!(b[0][0] < 0.0);
    }

    #[test]
    fn load_checks_weight_length() {
        let mut map = HashMap::new();
        map.insert(
            "model.norm.weight".to_string(),
            Tensor::ones(128, DType::F32, &Device::Cpu).unwrap(),
        );
        let table = WeightTable::from_tensors(map);
        let resolver = WeightResolver::new(&table);

        let ok = Norm::load(
            NormKind::Rms,
            &resolver,
            TensorRole::FinalNorm { bias: false },
            TensorRole::FinalNorm { bias: true },
            128,
            1e-5,
        )
        .unwrap();
        assert_eq!(ok.kind(), NormKind::Rms);

        let err = Norm::load(
            NormKind::Layer,
            &resolver,
            TensorRole::FinalNorm { bias: false },
            TensorRole::FinalNorm { bias: true },
            64,
            1e-5,
        )
        .unwrap_err();
        assert!(matches!(err, PocketError::ShapeMismatch(_)));
    }
}
