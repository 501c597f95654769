//! SafeTensors weight loading.
//!
//! A checkpoint directory holds either a single `model.safetensors` or a
//! sequence of shards named `model-XXXXX-of-YYYYY.safetensors`. Shards are
//! read in sorted order and merged by key into one [`WeightTable`].
//!
//! # Example
//!
//! ```ignore
//! use pocketlm_core::model::WeightTable;
//!
//! let table = WeightTable::from_dir(Path::new("/path/to/model"), &Device::Cpu)?;
//! let embed = table.get("model.embed_tokens.weight");
//! ```

use crate::error::{PocketError, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of an unsharded checkpoint.
pub const SINGLE_FILE: &str = "model.safetensors";

/// Name to tensor mapping, read-only once loading finishes.
#[derive(Debug, Clone, Default)]
pub struct WeightTable {
    tensors: HashMap<String, Tensor>,
}

impl WeightTable {
    /// Wrap an in-memory mapping.
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Load every checkpoint file of a model directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let files = checkpoint_files(dir)?;
        let mut tensors = HashMap::new();
        for path in &files {
            let file_tensors = load_safetensors_file(path, device)?;
            debug!(file = %path.display(), count = file_tensors.len(), "loaded shard");
            for (name, tensor) in file_tensors {
                if tensors.insert(name.clone(), tensor).is_some() {
                    warn!(tensor = %name, "tensor appears in more than one shard; keeping the later one");
                }
            }
        }
        Ok(Self { tensors })
    }

    /// Load a single safetensors file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        Ok(Self {
            tensors: load_safetensors_file(path, device)?,
        })
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Insert or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Remove a tensor.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    /// All tensor names, sorted.
    pub fn sorted_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Iterate over all names (unordered).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Consume the table.
    pub fn into_inner(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}

/// Locate the checkpoint files of a directory in load order.
///
/// Preference: `model.safetensors`, then `model-*-of-*.safetensors` shards,
/// then any other `.safetensors` file.
pub fn checkpoint_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join(SINGLE_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }

    let mut shards = Vec::new();
    let mut others = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |e| e != "safetensors") {
            continue;
        }
        let is_shard = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, is_shard_name);
        if is_shard {
            shards.push(path);
        } else {
            others.push(path);
        }
    }

    let mut files = if shards.is_empty() { others } else { shards };
    files.sort();

    if files.is_empty() {
        return Err(PocketError::Model(format!(
            "No .safetensors files found in {}",
            dir.display()
        )));
    }
    Ok(files)
}

/// `model-00001-of-00002.safetensors`
fn is_shard_name(name: &str) -> bool {
    let Some(stem) = name
        .strip_prefix("model-")
        .and_then(|s| s.strip_suffix(".safetensors"))
    else {
        return false;
    };
    match stem.split_once("-of-") {
        Some((index, total)) => {
            !index.is_empty()
                && !total.is_empty()
                && index.bytes().all(|b| b.is_ascii_digit())
                && total.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let data = fs::read(path)?;
    let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
        PocketError::Model(format!("Failed to deserialize {}: {}", path.display(), e))
    })?;

    let mut tensors = HashMap::new();
    for (name, view) in safetensors.tensors() {
        let tensor = view_to_tensor(&view, device)?;
        tensors.insert(name.to_string(), tensor);
    }
    Ok(tensors)
}

/// Convert a SafeTensors view to a Candle tensor.
///
/// Floating point tensors are widened to f32; integer tensors (packed
/// quantized weights) keep an integer dtype.
fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let values: Vec<half::f16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?.to_dtype(DType::F32)?
        }
        safetensors::Dtype::BF16 => {
            let values: Vec<half::bf16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?.to_dtype(DType::F32)?
        }
        safetensors::Dtype::F64 => {
            let values: Vec<f64> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?.to_dtype(DType::F32)?
        }
        safetensors::Dtype::I64 => {
            let values: Vec<i64> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::I32 => {
            // Candle has no I32, upcast
            let values: Vec<i32> = bytemuck::pod_collect_to_vec(data);
            let values: Vec<i64> = values.into_iter().map(i64::from).collect();
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::U32 => {
            let values: Vec<u32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::U8 => Tensor::from_slice(data, shape.as_slice(), device)?,
        other => {
            return Err(PocketError::Model(format!("Unsupported dtype: {:?}", other)));
        }
    };

    Ok(tensor)
}
