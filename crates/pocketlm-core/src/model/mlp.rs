//! Gated MLP (SwiGLU).
//!
//! # Formula
//!
//! `MLP(x) = down(silu(gate(x)) * up(x))`
//!
//! Where `silu(x) = x * sigmoid(x)`
//!
//! Checkpoints store gate/up either as two matrices or as one fused
//! `gate_up_proj` whose output axis is `[gate | up]`.
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::attention::reconcile_width;
use super::{LayerPart, Linear, TensorRole, WeightResolver};
use crate::error::{PocketError, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::silu;

/// Physical layout of the gate and up projections.
#[derive(Debug, Clone)]
pub enum GateUpProjection {
    /// Two matrices.
    Separate {
        /// Gate projection: hidden -> intermediate
        gate: Linear,
        /// Up projection: hidden -> intermediate
        up: Linear,
    },
    /// One matrix producing `[gate | up]`, split in half.
    Fused(Linear),
}

/// SwiGLU MLP block.
#[derive(Debug, Clone)]
pub struct GatedMlp {
    gate_up: GateUpProjection,
    /// Down projection: intermediate -> hidden
    down_proj: Linear,
    /// Intermediate dimension.
    intermediate_size: usize,
}

impl GatedMlp {
    /// Create from projections.
    pub fn new(gate_up: GateUpProjection, down_proj: Linear) -> Result<Self> {
        let intermediate_size = match &gate_up {
            GateUpProjection::Separate { gate, up } => {
                if gate.out_features() != up.out_features() {
                    return Err(PocketError::ShapeMismatch(format!(
                        "gate has {} outputs but up has {}",
                        gate.out_features(),
                        up.out_features()
                    )));
                }
                gate.out_features()
            }
            GateUpProjection::Fused(w) => {
                if w.out_features() % 2 != 0 {
                    return Err(PocketError::ShapeMismatch(format!(
                        "fused gate_up has odd output width {}",
                        w.out_features()
                    )));
                }
                w.out_features() / 2
            }
        };
        Ok(Self {
            gate_up,
            down_proj,
            intermediate_size,
        })
    }

    /// Resolve the projections of layer `index`, preferring a fused `gate_up_proj`.
    pub fn load(resolver: &WeightResolver<'_>, index: usize) -> Result<Self> {
        let load = |part| {
            Linear::load(
                resolver,
                TensorRole::weight(index, part),
                TensorRole::bias(index, part),
            )
        };
        let gate_up = if resolver.has(TensorRole::weight(index, LayerPart::FusedGateUp)) {
            GateUpProjection::Fused(load(LayerPart::FusedGateUp)?)
        } else {
            GateUpProjection::Separate {
                gate: load(LayerPart::Gate)?,
                up: load(LayerPart::Up)?,
            }
        };
        Self::new(gate_up, load(LayerPart::Down)?)
    }

    /// Create a new MLP with random weights (for testing).
    pub fn random(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        Self::new(
            GateUpProjection::Separate {
                gate: Linear::random(hidden_size, intermediate_size, device)?,
                up: Linear::random(hidden_size, intermediate_size, device)?,
            },
            Linear::random(intermediate_size, hidden_size, device)?,
        )
    }

    /// Create with zeros (for testing specific behaviors).
    pub fn zeros(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        let zeros = |o: usize, i: usize| -> Result<Linear> {
            Linear::new(Tensor::zeros((o, i), DType::F32, device)?, None)
        };
        Self::new(
            GateUpProjection::Separate {
                gate: zeros(intermediate_size, hidden_size)?,
                up: zeros(intermediate_size, hidden_size)?,
            },
            zeros(hidden_size, intermediate_size)?,
        )
    }

    /// Forward pass over `[..., hidden_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (gate, up) = match &self.gate_up {
            GateUpProjection::Separate { gate, up } => (gate.forward(x)?, up.forward(x)?),
            GateUpProjection::Fused(w) => {
                let fused = w.forward(x)?;
                let half = self.intermediate_size;
                (fused.narrow(D::Minus1, 0, half)?, fused.narrow(D::Minus1, half, half)?)
            }
        };

        let activated = (silu(&gate)? * up)?;
        let activated = reconcile_width(&activated, self.down_proj.in_features(), "mlp activation")?;
        self.down_proj.forward(&activated)
    }

    /// Output width.
    pub fn hidden_size(&self) -> usize {
        self.down_proj.out_features()
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    /// Whether gate and up share one matrix.
    pub fn is_fused(&self) -> bool {
        matches!(self.gate_up, GateUpProjection::Fused(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mlp() -> GatedMlp {
        GatedMlp::random(64, 128, &Device::Cpu).unwrap()
    }

    #[test]
    fn mlp_creation() {
        let mlp = create_test_mlp();
        assert_eq!(mlp.hidden_size(), 64);
        assert_eq!(mlp.intermediate_size(), 128);
        assert!(!mlp.is_fused());
    }

    #[test]
    fn mlp_forward_3d() {
        let mlp = create_test_mlp();
        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 64], &Device::Cpu).unwrap();
        let output = mlp.forward(&x).unwrap();
        assert_eq!(output.dims(), &[2, 16, 64]);
    }

    #[test]
    fn mlp_zeros_gives_zeros() {
        let mlp = GatedMlp::zeros(64, 128, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 64], &Device::Cpu).unwrap();
        let output = mlp.forward(&x).unwrap();
        let sum: f32 = output.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(sum < 1e-6, "Expected near-zero output, got sum={}", sum);
    }

    #[test]
    fn silu_applies_to_gate_not_up() {
        // gate(x) = 1, up(x) = -2 for x = [1]; down = identity
        let gate = Linear::new(Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap(), None).unwrap();
        let up = Linear::new(Tensor::new(&[[-2.0f32]], &Device::Cpu).unwrap(), None).unwrap();
        let down = Linear::new(Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap(), None).unwrap();
        let mlp = GatedMlp::new(GateUpProjection::Separate { gate, up }, down).unwrap();

        let x = Tensor::new(&[[1.0f32]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = mlp.forward(&x).unwrap().to_vec2().unwrap();
        let silu_one = 1.0f32 / (1.0 + (-1.0f32).exp());
        assert!((out[0][0] - silu_one * -2.0).abs() < 1e-5);
    }

    #[test]
    fn fused_matches_separate() {
        let mlp = create_test_mlp();
        let (gate, up) = match &mlp.gate_up {
            GateUpProjection::Separate { gate, up } => (gate, up),
            GateUpProjection::Fused(_) => unreachable!(),
        };
        let fused_w = Tensor::cat(&[gate.weight(), up.weight()], 0).unwrap();
        let fused = GatedMlp::new(
            GateUpProjection::Fused(Linear::new(fused_w, None).unwrap()),
            mlp.down_proj.clone(),
        )
        .unwrap();
        assert!(fused.is_fused());
        assert_eq!(fused.intermediate_size(), 128);

        let x = Tensor::randn(0.0f32, 1.0, &[1, 3, 64], &Device::Cpu).unwrap();
        let a = mlp.forward(&x).unwrap();
        let b = fused.forward(&x).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn activation_one_wider_than_down_is_truncated() {
        let gate_up = GateUpProjection::Separate {
            gate: Linear::random(8, 17, &Device::Cpu).unwrap(),
            up: Linear::random(8, 17, &Device::Cpu).unwrap(),
        };
        let mlp = GatedMlp::new(gate_up, Linear::random(16, 8, &Device::Cpu).unwrap()).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 8], &Device::Cpu).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[1, 2, 8]);
    }

    #[test]
    fn activation_one_narrower_than_down_fails() {
        let gate_up = GateUpProjection::Separate {
            gate: Linear::random(8, 15, &Device::Cpu).unwrap(),
            up: Linear::random(8, 15, &Device::Cpu).unwrap(),
        };
        let mlp = GatedMlp::new(gate_up, Linear::random(16, 8, &Device::Cpu).unwrap()).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 8], &Device::Cpu).unwrap();
        assert!(matches!(mlp.forward(&x), Err(PocketError::ShapeMismatch(_))));
    }

    #[test]
    fn mismatched_gate_and_up_rejected() {
        let gate_up = GateUpProjection::Separate {
            gate: Linear::random(8, 16, &Device::Cpu).unwrap(),
            up: Linear::random(8, 12, &Device::Cpu).unwrap(),
        };
        let down = Linear::random(16, 8, &Device::Cpu).unwrap();
        assert!(GatedMlp::new(gate_up, down).is_err());
    }
}
