//! Affine group dequantization.

use super::{BIASES_SUFFIX, SCALES_SUFFIX, WEIGHT_SUFFIX};
use crate::error::{PocketError, Result};
use crate::model::WeightTable;
use candle_core::{DType, Tensor};
use tracing::{debug, info, warn};

/// A packed weight with its group parameters.
#[derive(Debug, Clone)]
pub struct AffineQuantized {
    /// Packed values `[out, packed_in]`.
    pub weight: Tensor,
    /// Per-group scales `[out, groups]`.
    pub scales: Tensor,
    /// Per-group offsets `[out, groups]`.
    pub biases: Tensor,
}

impl AffineQuantized {
    /// Bundle the three tensors.
    pub fn new(weight: Tensor, scales: Tensor, biases: Tensor) -> Self {
        Self {
            weight,
            scales,
            biases,
        }
    }

    /// Number of groups along the packed axis.
    pub fn groups(&self) -> usize {
        self.scales.dims().last().copied().unwrap_or(1)
    }

    /// Width each group covers in the packed weight.
    pub fn group_size(&self) -> usize {
        let packed = self.weight.dims().last().copied().unwrap_or(1);
        packed / self.groups().max(1)
    }

    /// Reconstruct the full-precision weight.
    pub fn dequantize(&self) -> Result<Tensor> {
        dequantize(&self.weight, &self.scales, &self.biases)
    }
}

/// Reconstruct `packed * scale + bias`.
///
/// When the packed axis already has one column per group the parameters
/// broadcast directly; otherwise each group value is repeated across the
/// group's width first. The output always has the packed weight's shape.
pub fn dequantize(packed: &Tensor, scales: &Tensor, biases: &Tensor) -> Result<Tensor> {
    let weight = packed.to_dtype(DType::F32)?;
    let scales = scales.to_dtype(DType::F32)?;
    let biases = biases.to_dtype(DType::F32)?;

    if weight.rank() != 2 || scales.rank() != 2 {
        return Ok(weight.broadcast_mul(&scales)?.broadcast_add(&biases)?);
    }

    let (_, packed_in) = weight.dims2()?;
    let groups = scales.dim(1)?;

    if packed_in == groups {
        return Ok(weight.broadcast_mul(&scales)?.broadcast_add(&biases)?);
    }

    if groups == 0 || packed_in % groups != 0 {
        return Err(PocketError::ShapeMismatch(format!(
            "packed width {} is not a multiple of {} quantization groups",
            packed_in, groups
        )));
    }
    let group_size = packed_in / groups;
    let scales = repeat_groups(&scales, groups, group_size)?;
    let biases = repeat_groups(&biases, groups, group_size)?;

    Ok(weight.broadcast_mul(&scales)?.broadcast_add(&biases)?)
}

/// `[r, g]` -> `[r, g * group_size]` with each column repeated in place.
fn repeat_groups(t: &Tensor, groups: usize, group_size: usize) -> Result<Tensor> {
    let rows = t.dim(0)?;
    Ok(t.unsqueeze(2)?
        .broadcast_as((rows, groups, group_size))?
        .reshape((rows, groups * group_size))?)
}

/// Repeat each column so a `[out, n]` matrix reaches `[out, target]`.
///
/// Only exact integer expansion factors are applied; anything else returns
/// the input unchanged.
pub fn expand_columns(weight: &Tensor, target: usize) -> Result<Tensor> {
    if weight.rank() != 2 {
        return Ok(weight.clone());
    }
    let (rows, cols) = weight.dims2()?;
    if cols == 0 || target <= cols || target % cols != 0 {
        return Ok(weight.clone());
    }
    let factor = target / cols;
    Ok(weight
        .unsqueeze(2)?
        .broadcast_as((rows, cols, factor))?
        .reshape((rows, target))?)
}

/// Whether the table carries any quantization parameters.
pub fn is_quantized(table: &WeightTable) -> bool {
    let mut has_scales = false;
    let mut has_biases = false;
    for name in table.names() {
        has_scales |= name.ends_with(SCALES_SUFFIX);
        has_biases |= name.ends_with(BIASES_SUFFIX);
    }
    has_scales && has_biases
}

/// Dequantize every packed weight of a table.
///
/// `target_in` names the expected input width of a weight (by tensor name)
/// so packed matrices stored at reduced column resolution can be expanded.
/// The `.scales`/`.biases` entries are removed from the returned table;
/// tensors without them pass through untouched.
pub fn dequantize_table(
    mut table: WeightTable,
    target_in: &dyn Fn(&str) -> Option<usize>,
) -> Result<WeightTable> {
    if !is_quantized(&table) {
        return Ok(table);
    }

    let mut bases: Vec<String> = table
        .names()
        .filter_map(|n| n.strip_suffix(SCALES_SUFFIX))
        .map(str::to_string)
        .collect();
    bases.sort();

    let mut converted = 0usize;
    for base in bases {
        let weight_name = format!("{}{}", base, WEIGHT_SUFFIX);
        let scales_name = format!("{}{}", base, SCALES_SUFFIX);
        let biases_name = format!("{}{}", base, BIASES_SUFFIX);

        let (Some(weight), Some(biases)) = (table.get(&weight_name), table.get(&biases_name))
        else {
            warn!(tensor = %base, "scales without matching weight/biases; left as-is");
            continue;
        };
        let (weight, biases) = (weight.clone(), biases.clone());
        let scales = table
            .remove(&scales_name)
            .ok_or_else(|| PocketError::Model(format!("{} vanished", scales_name)))?;
        table.remove(&biases_name);

        let mut full = dequantize(&weight, &scales, &biases)?;
        if let Some(target) = target_in(&weight_name) {
            full = expand_columns(&full, target)?;
        }
        debug!(tensor = %weight_name, shape = ?full.dims(), "dequantized");
        table.insert(weight_name, full);
        converted += 1;
    }

    info!(converted, "dequantized packed weights");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn t2(data: &[f32], rows: usize, cols: usize) -> Tensor {
        Tensor::from_slice(data, (rows, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn direct_broadcast_when_groups_match() {
        let w = t2(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let s = t2(&[2.0, 3.0, 4.0, 5.0], 2, 2);
        let b = t2(&[0.5, 0.5, -1.0, -1.0], 2, 2);
        let out = dequantize(&w, &s, &b).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![2.5, 6.5], vec![11.0, 19.0]]
        );
    }

    #[test]
    fn groups_expand_across_width() {
        // 1 row, 4 packed columns, 2 groups of 2
        let w = t2(&[1.0, 1.0, 1.0, 1.0], 1, 4);
        let s = t2(&[2.0, 10.0], 1, 2);
        let b = t2(&[0.0, 1.0], 1, 2);
        let out = dequantize(&w, &s, &b).unwrap();
        assert_eq!(out.dims(), &[1, 4]);
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![2.0, 2.0, 11.0, 11.0]]);
    }

    #[test]
    fn packed_integers_are_widened() {
        let w = Tensor::new(&[[3u32, 4]], &Device::Cpu).unwrap();
        let s = t2(&[0.5], 1, 1);
        let b = t2(&[1.0], 1, 1);
        let out = dequantize(&w, &s, &b).unwrap();
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(out.to_vec2::<f32>().unwrap(), vec![vec![2.5, 3.0]]);
    }

    #[test]
    fn uneven_groups_rejected() {
        let w = t2(&[1.0; 5], 1, 5);
        let s = t2(&[1.0, 1.0], 1, 2);
        let b = t2(&[0.0, 0.0], 1, 2);
        assert!(matches!(
            dequantize(&w, &s, &b),
            Err(PocketError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn expand_columns_exact_factor_only() {
        let w = t2(&[1.0, 2.0], 1, 2);
        let out = expand_columns(&w, 6).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]]
        );
        assert_eq!(expand_columns(&w, 5).unwrap().dims(), &[1, 2]);
        assert_eq!(expand_columns(&w, 2).unwrap().dims(), &[1, 2]);
    }

    #[test]
    fn table_strips_scales_and_biases() {
        let mut map = HashMap::new();
        map.insert("l.q_proj.weight".to_string(), t2(&[1.0, 1.0], 1, 2));
        map.insert("l.q_proj.scales".to_string(), t2(&[3.0], 1, 1));
        map.insert("l.q_proj.biases".to_string(), t2(&[1.0], 1, 1));
        map.insert("l.q_proj.bias".to_string(), t2(&[7.0], 1, 1));
        map.insert("norm.weight".to_string(), t2(&[9.0, 9.0], 1, 2));
        let table = WeightTable::from_tensors(map);
        assert!(is_quantized(&table));

        let out = dequantize_table(table, &|_| None).unwrap();
        assert_eq!(out.sorted_names(), vec!["l.q_proj.bias", "l.q_proj.weight", "norm.weight"]);
        assert_eq!(
            out.get("l.q_proj.weight").unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![4.0, 4.0]]
        );
        assert_eq!(
            out.get("norm.weight").unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![9.0, 9.0]]
        );
    }

    #[test]
    fn table_expands_to_target_width() {
        let mut map = HashMap::new();
        map.insert("w.weight".to_string(), t2(&[1.0, 2.0], 1, 2));
        map.insert("w.scales".to_string(), t2(&[1.0, 1.0], 1, 2));
        map.insert("w.biases".to_string(), t2(&[0.0, 0.0], 1, 2));
        let out = dequantize_table(WeightTable::from_tensors(map), &|_| Some(4)).unwrap();
        assert_eq!(
            out.get("w.weight").unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 2.0, 2.0]]
        );
    }

    #[test]
    fn float_table_untouched() {
        let mut map = HashMap::new();
        map.insert("w.weight".to_string(), t2(&[1.0, 2.0], 1, 2));
        let out = dequantize_table(WeightTable::from_tensors(map), &|_| Some(4)).unwrap();
        assert_eq!(out.get("w.weight").unwrap().dims(), &[1, 2]);
    }

    proptest! {
        #[test]
        fn grouped_matches_scalar_reference(
            rows in 1usize..4,
            groups in 1usize..5,
            group_size in 1usize..5,
            seed in 0u32..1000,
        ) {
            let cols = groups * group_size;
            let w: Vec<f32> = (0..rows * cols).map(|i| ((i as u32 * 7 + seed) % 16) as f32).collect();
            let s: Vec<f32> = (0..rows * groups).map(|i| 0.1 + (i as f32) * 0.25).collect();
            let b: Vec<f32> = (0..rows * groups).map(|i| (i as f32) - 1.5).collect();

            let out = dequantize(&t2(&w, rows, cols), &t2(&s, rows, groups), &t2(&b, rows, groups))
                .unwrap()
                .to_vec2::<f32>()
                .unwrap();

            for r in 0..rows {
                for c in 0..cols {
                    let g = if cols == groups { c } else { c / group_size };
                    let expected = w[r * cols + c] * s[r * groups + g] + b[r * groups + g];
                    prop_assert!((out[r][c] - expected).abs() < 1e-4);
                }
            }
        }
    }
}
