//! Phi-3 family loader.
//!
//! Phi-3 exports fuse the attention input projections into `qkv_proj`
//! and the MLP gate/up into `gate_up_proj`, keep an explicit `lm_head`,
//! and use RMSNorm. Quantized (MLX-style) exports are dequantized at load.

use super::registry::{load_transformer, CausalLm, ModelLoader};
use super::Architecture;
use crate::error::Result;
use candle_core::Device;
use serde_json::Value;
use std::path::Path;

/// Loader for [`Architecture::Phi3Mini`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Phi3Loader;

impl ModelLoader for Phi3Loader {
    fn architecture(&self) -> Architecture {
        Architecture::Phi3Mini
    }

    fn load(&self, dir: &Path, config: &Value, device: &Device) -> Result<Box<dyn CausalLm>> {
        Ok(Box::new(load_transformer(
            dir,
            config,
            Architecture::Phi3Mini,
            device,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::synthetic::SyntheticCheckpoint;

    fn load(ckpt: &SyntheticCheckpoint) -> Box<dyn CausalLm> {
        let dir = tempfile::tempdir().unwrap();
        ckpt.write_to(dir.path()).unwrap();
        Phi3Loader
            .load(dir.path(), &ckpt.config_json, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn quantized_checkpoint_matches_full_precision() {
        let full = SyntheticCheckpoint::random(Architecture::Phi3Mini, 5).unwrap();
        let packed = full.clone().affine_quantized(4).unwrap();

        let a = load(&full);
        let b = load(&packed);
        let la = a.step(&[2, 4, 6], &mut a.new_cache()).unwrap();
        let lb = b.step(&[2, 4, 6], &mut b.new_cache()).unwrap();
        let diff: f32 = (la - lb)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "max diff {}", diff);
    }

    #[test]
    fn phi3_defaults_fill_missing_keys() {
        let mut ckpt = SyntheticCheckpoint::counting(Architecture::Phi3Mini).unwrap();
        let obj = ckpt.config_json.as_object_mut().unwrap();
        obj.remove("rope_theta");
        obj.remove("rms_norm_eps");
        let model = load(&ckpt);
        assert_eq!(model.config().rope_theta, 10_000.0);
        assert_eq!(model.config().norm_eps, 1e-5);
        assert_eq!(model.architecture(), Architecture::Phi3Mini);
    }

    #[test]
    fn missing_qkv_reports_separate_query_aliases() {
        let mut ckpt = SyntheticCheckpoint::counting(Architecture::Phi3Mini).unwrap();
        ckpt.tensors
            .remove("model.layers.0.self_attn.qkv_proj.weight");
        let dir = tempfile::tempdir().unwrap();
        ckpt.write_to(dir.path()).unwrap();
        let err = Phi3Loader
            .load(dir.path(), &ckpt.config_json, &Device::Cpu)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("layer 0 query projection weight"), "{}", message);
        assert!(message.contains("model.layers.0.self_attn.q_proj.weight"));
    }
}
