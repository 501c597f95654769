//! Low-bit weight dequantization.
//!
//! Quantized checkpoints (MLX style) store each linear weight as packed
//! low-bit values next to per-group affine parameters:
//!
//! - `<name>.weight`: packed values `[out, packed_in]`
//! - `<name>.scales`: per-group scale `[out, groups]`
//! - `<name>.biases`: per-group offset `[out, groups]`
//!
//! Reconstruction is `weight * scale + bias` with each group's parameters
//! repeated across the group's width. It runs once, at load time, over the
//! whole weight table.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pocketlm_core::quantization::dequantize_table;
//!
//! let table = dequantize_table(table, &|_name| Some(3072))?;
//! ```

mod affine;

pub use affine::{dequantize, dequantize_table, expand_columns, is_quantized, AffineQuantized};

/// Suffix of per-group scale tensors.
pub const SCALES_SUFFIX: &str = ".scales";
/// Suffix of per-group offset tensors.
pub const BIASES_SUFFIX: &str = ".biases";
/// Suffix of packed weight tensors.
pub const WEIGHT_SUFFIX: &str = ".weight";
