//! Affine projection `y = x · Wᵗ + b` with `W` stored `[out, in]`.

use super::{TensorRole, WeightResolver};
use crate::error::{PocketError, Result};
use candle_core::{Device, Tensor};

/// Linear layer.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight `[out_features, in_features]`.
    weight: Tensor,
    /// Optional bias `[out_features]`.
    bias: Option<Tensor>,
}

impl Linear {
    /// Create from weight and optional bias.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if weight.rank() != 2 {
            return Err(PocketError::ShapeMismatch(format!(
                "linear weight must be 2D, got {:?}",
                weight.dims()
            )));
        }
        if let Some(b) = &bias {
            if b.elem_count() != weight.dim(0)? {
                return Err(PocketError::ShapeMismatch(format!(
                    "linear bias has {} elements for {} outputs",
                    b.elem_count(),
                    weight.dim(0)?
                )));
            }
        }
        Ok(Self { weight, bias })
    }

    /// Resolve a weight role and its optional bias.
    pub fn load(resolver: &WeightResolver<'_>, weight: TensorRole, bias: TensorRole) -> Result<Self> {
        Self::new(resolver.resolve(weight)?, resolver.resolve_optional(bias))
    }

    /// Random weights (for testing).
    pub fn random(in_features: usize, out_features: usize, device: &Device) -> Result<Self> {
        let weight = Tensor::randn(0.0f32, 0.02, (out_features, in_features), device)?;
        Ok(Self { weight, bias: None })
    }

    /// Forward pass over `[..., in_features]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let in_features = self.in_features();
        let last = dims.last().copied().unwrap_or(0);
        if last != in_features {
            return Err(PocketError::ShapeMismatch(format!(
                "linear expects input width {}, got {}",
                in_features, last
            )));
        }

        // Flatten leading dims for a single 2D matmul
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let x_2d = x.reshape((rows, in_features))?;
        let mut out = x_2d.matmul(&self.weight.t()?)?;
        if let Some(b) = &self.bias {
            out = out.broadcast_add(b)?;
        }

        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = self.out_features();
        }
        Ok(out.reshape(out_dims)?)
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias tensor.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Split along the output axis into consecutive pieces of the given widths.
    ///
    /// Used to unpack fused projections (`qkv_proj`, `gate_up_proj`).
    pub fn split_outputs(&self, widths: &[usize]) -> Result<Vec<Linear>> {
        let total: usize = widths.iter().sum();
        if total != self.out_features() {
            return Err(PocketError::ShapeMismatch(format!(
                "cannot split {} outputs into {:?}",
                self.out_features(),
                widths
            )));
        }
        let mut start = 0;
        let mut parts = Vec::with_capacity(widths.len());
        for &w in widths {
            let weight = self.weight.narrow(0, start, w)?.contiguous()?;
            let bias = match &self.bias {
                Some(b) => Some(b.narrow(0, start, w)?.contiguous()?),
                None => None,
            };
            parts.push(Linear { weight, bias });
            start += w;
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_matches_manual() {
        let w = Tensor::new(&[[1.0f32, 2.0], [0.0, -1.0], [3.0, 0.5]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[0.5f32, 0.0, -1.0], &Device::Cpu).unwrap();
        let lin = Linear::new(w, Some(b)).unwrap();

        let x = Tensor::new(&[[[1.0f32, 1.0]]], &Device::Cpu).unwrap();
        let y = lin.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 1, 3]);
        let y: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(y, vec![3.5, -1.0, 2.5]);
    }

    #[test]
    fn wrong_input_width_is_error() {
        let lin = Linear::random(4, 2, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(lin.forward(&x), Err(PocketError::ShapeMismatch(_))));
    }

    #[test]
    fn bias_length_checked() {
        let w = Tensor::zeros((3, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(Linear::new(w, Some(b)).is_err());
    }

    #[test]
    fn split_outputs_partitions_rows() {
        let w = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((6, 2))
            .unwrap();
        let lin = Linear::new(w, None).unwrap();
        let parts = lin.split_outputs(&[2, 3, 1]).unwrap();
        assert_eq!(parts[0].out_features(), 2);
        assert_eq!(parts[1].out_features(), 3);
        assert_eq!(
            parts[2].weight().to_vec2::<f32>().unwrap(),
            vec![vec![10.0, 11.0]]
        );
        assert!(lin.split_outputs(&[2, 2]).is_err());
    }
}
