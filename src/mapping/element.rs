//! Mapping-table entries and how fused tensors are split for storage

use crate::error::{Error, Result};
use crate::tensor::{self, Tensor};
use serde::{Deserialize, Serialize};

/// Axis a fused tensor is packed along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitFormat {
    /// Sub-tensors are stacked along the output (row) axis.
    O,
    /// Sub-tensors are stacked along the input (column) axis.
    I,
}

/// Canonical target(s) of one external checkpoint key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeightElement {
    /// Canonical parameter names, one per packed sub-tensor.
    pub names: Vec<String>,
    pub format: SplitFormat,
    /// Start offsets of each sub-tensor along the split axis.
    pub offsets: Option<Vec<usize>>,
    /// Multiplier applied before writing.
    pub scale: f32,
}

impl ModelWeightElement {
    /// Single canonical target.
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            format: SplitFormat::O,
            offsets: None,
            scale: 1.0,
        }
    }

    /// Several canonical targets packed along `format`.
    pub fn fused(names: Vec<String>, format: SplitFormat) -> Self {
        Self {
            names,
            format,
            offsets: None,
            scale: 1.0,
        }
    }

    pub fn with_offsets(mut self, offsets: Vec<usize>) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Number of canonical sub-tensors.
    pub fn count(&self) -> usize {
        self.names.len()
    }

    /// Boundaries of sub-tensor `i` along an axis of length `len`.
    ///
    /// Uses the explicit offsets when present, equal parts otherwise; the
    /// last part always ends at `len`.
    pub fn bounds(&self, i: usize, len: usize) -> (usize, usize) {
        let count = self.count();
        match &self.offsets {
            Some(offsets) => {
                let start = offsets.get(i).copied().unwrap_or(len).min(len);
                let end = if i + 1 < count {
                    offsets.get(i + 1).copied().unwrap_or(len).min(len)
                } else {
                    len
                };
                (start, end.max(start))
            }
            None => equal_bounds(i, count, len),
        }
    }

    /// Split `tensor` into `(canonical name, tensor)` pairs ready to store.
    ///
    /// `write_format` is the axis the caller's tensor is laid out on: `O` for
    /// full weights and adapter up factors, `I` for adapter down factors.
    /// Diagonal flags request block extraction instead of sharing.
    pub fn split(
        &self,
        tensor: &Tensor,
        write_format: SplitFormat,
        is_diagonal_up: bool,
        is_diagonal_down: bool,
    ) -> Result<Vec<(String, Tensor)>> {
        let tensor = if self.scale == 1.0 {
            tensor.clone()
        } else {
            tensor::scaled(tensor, self.scale)
        };
        let count = self.count();
        if count <= 1 {
            return Ok(self.shared(&tensor));
        }
        let tensor = match write_format {
            SplitFormat::O => tensor::squeezed(&tensor),
            SplitFormat::I => tensor,
        };
        let shape = tensor.shape().to_vec();
        let mut parts = Vec::with_capacity(count);
        match (write_format, self.format) {
            (SplitFormat::O, SplitFormat::O) if is_diagonal_up && shape.len() >= 2 => {
                for (i, name) in self.names.iter().enumerate() {
                    let (r0, r1) = self.bounds(i, shape[0]);
                    let (c0, c1) = equal_bounds(i, count, shape[1]);
                    parts.push((name.clone(), tensor::block(&tensor, r0..r1, c0..c1)?));
                }
            }
            (SplitFormat::O, SplitFormat::O) => {
                for (i, name) in self.names.iter().enumerate() {
                    let (r0, r1) = self.bounds(i, shape[0]);
                    parts.push((name.clone(), tensor::slice_axis(&tensor, 0, r0..r1)?));
                }
            }
            (SplitFormat::O, SplitFormat::I) if is_diagonal_down && shape.len() >= 2 => {
                for (i, name) in self.names.iter().enumerate() {
                    let (c0, c1) = equal_bounds(i, count, shape[1]);
                    parts.push((name.clone(), tensor::slice_axis(&tensor, 1, c0..c1)?));
                }
            }
            (SplitFormat::O, SplitFormat::I) => return Ok(self.shared(&tensor)),
            (SplitFormat::I, SplitFormat::I) if is_diagonal_down && shape.len() >= 2 => {
                for (i, name) in self.names.iter().enumerate() {
                    let (r0, r1) = equal_bounds(i, count, shape[0]);
                    let (c0, c1) = self.bounds(i, shape[1]);
                    parts.push((name.clone(), tensor::block(&tensor, r0..r1, c0..c1)?));
                }
            }
            (SplitFormat::I, SplitFormat::I) => {
                let axis = if shape.len() == 1 { 0 } else { 1 };
                for (i, name) in self.names.iter().enumerate() {
                    let (c0, c1) = self.bounds(i, shape[axis]);
                    parts.push((name.clone(), tensor::slice_axis(&tensor, axis, c0..c1)?));
                }
            }
            (SplitFormat::I, SplitFormat::O) if is_diagonal_up => {
                for (i, name) in self.names.iter().enumerate() {
                    let (r0, r1) = equal_bounds(i, count, shape[0]);
                    parts.push((name.clone(), tensor::slice_axis(&tensor, 0, r0..r1)?));
                }
            }
            (SplitFormat::I, SplitFormat::O) => return Ok(self.shared(&tensor)),
        }
        Ok(parts)
    }

    fn shared(&self, tensor: &Tensor) -> Vec<(String, Tensor)> {
        self.names
            .iter()
            .map(|name| (name.clone(), tensor.clone()))
            .collect()
    }

    /// Whether an up factor only touches one column block per output block.
    ///
    /// Requires an output-packed element, a 2-D tensor and a column count
    /// divisible by the element count. For every row block `i` all columns
    /// outside column block `i` must be exactly zero.
    pub fn is_diagonal_up(&self, tensor: &Tensor) -> bool {
        let count = self.count();
        let shape = tensor.shape();
        if count < 2 || self.format != SplitFormat::O || shape.len() != 2 {
            return false;
        }
        if shape[1] % count != 0 {
            return false;
        }
        for i in 0..count {
            let (r0, r1) = self.bounds(i, shape[0]);
            for j in (0..count).filter(|&j| j != i) {
                let (c0, c1) = equal_bounds(j, count, shape[1]);
                match tensor::block(tensor, r0..r1, c0..c1) {
                    Ok(block) if tensor::all_zero(&block) => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// Whether a down factor only reads one input block per row block.
    ///
    /// Requires an input-packed element, a 2-D tensor and a column count
    /// divisible by the element count. For every row block `i` all column
    /// blocks other than `i` must be exactly zero.
    pub fn is_diagonal_down(&self, tensor: &Tensor) -> bool {
        let count = self.count();
        let shape = tensor.shape();
        if count < 2 || self.format != SplitFormat::I || shape.len() != 2 {
            return false;
        }
        if shape[1] % count != 0 {
            return false;
        }
        for i in 0..count {
            let (r0, r1) = equal_bounds(i, count, shape[0]);
            for j in (0..count).filter(|&j| j != i) {
                let (c0, c1) = self.bounds(j, shape[1]);
                match tensor::block(tensor, r0..r1, c0..c1) {
                    Ok(block) if tensor::all_zero(&block) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

fn equal_bounds(i: usize, count: usize, len: usize) -> (usize, usize) {
    let start = i * len / count;
    let end = if i + 1 == count {
        len
    } else {
        (i + 1) * len / count
    };
    (start, end)
}

/// Check an element against the physical tensor it describes.
///
/// Offsets must increase strictly and stay inside the split axis.
pub fn validate_element(element: &ModelWeightElement, shape: &[usize]) -> Result<()> {
    let axis = match element.format {
        SplitFormat::O => 0,
        SplitFormat::I if shape.len() > 1 => 1,
        SplitFormat::I => 0,
    };
    let Some(&len) = shape.get(axis) else {
        return Err(Error::Shape(format!("{shape:?} has no axis {axis}")));
    };
    if let Some(offsets) = &element.offsets {
        if offsets.len() != element.count() {
            return Err(Error::Shape(format!(
                "{} offsets for {} names",
                offsets.len(),
                element.count()
            )));
        }
        if offsets.windows(2).any(|w| w[0] >= w[1]) || offsets.last().is_some_and(|&o| o >= len) {
            return Err(Error::Shape(format!(
                "offsets {offsets:?} do not partition an axis of {len}"
            )));
        }
    } else if element.count() > 1 && len % element.count() != 0 {
        return Err(Error::Shape(format!(
            "axis of {len} cannot be split into {} equal parts",
            element.count()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::from_shape_vec;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i}")).collect()
    }

    fn filled(shape: &[usize], f: impl Fn(usize, usize) -> f32) -> Tensor {
        let (rows, cols) = (shape[0], shape[1]);
        let values = (0..rows * cols).map(|k| f(k / cols, k % cols)).collect();
        from_shape_vec(shape, values).unwrap()
    }

    #[test]
    fn test_single_element_writes_under_every_name() {
        let element = ModelWeightElement::single("a");
        let t = filled(&[2, 2], |r, c| (r * 2 + c) as f32);
        let parts = element.split(&t, SplitFormat::O, false, false).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, "a");
        assert_eq!(parts[0].1, t);
    }

    #[test]
    fn test_output_split_by_offsets() {
        let element =
            ModelWeightElement::fused(names(3), SplitFormat::O).with_offsets(vec![0, 2, 3]);
        let t = filled(&[6, 2], |r, _| r as f32);
        let parts = element.split(&t, SplitFormat::O, false, false).unwrap();
        let rows: Vec<usize> = parts.iter().map(|(_, p)| p.shape()[0]).collect();
        assert_eq!(rows, vec![2, 1, 3]);
        assert_abs_diff_eq!(parts[2].1[[0, 0]], 3.0);
    }

    #[test]
    fn test_output_split_of_bias_uses_dim_zero() {
        let element = ModelWeightElement::fused(names(3), SplitFormat::O);
        let t = from_shape_vec(&[6], (0..6).map(|v| v as f32).collect()).unwrap();
        let parts = element.split(&t, SplitFormat::O, false, false).unwrap();
        assert_eq!(parts[1].1.iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_down_factor_shared_for_output_fusion() {
        let element = ModelWeightElement::fused(names(3), SplitFormat::O);
        let down = filled(&[4, 5], |r, c| (r + c) as f32);
        let parts = element.split(&down, SplitFormat::I, false, false).unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|(_, p)| *p == down));
    }

    #[test]
    fn test_diagonal_up_takes_blocks() {
        let element = ModelWeightElement::fused(names(2), SplitFormat::O);
        let up = filled(&[4, 2], |r, c| if (r < 2) == (c == 0) { 1.0 + r as f32 } else { 0.0 });
        assert!(element.is_diagonal_up(&up));
        let parts = element.split(&up, SplitFormat::O, true, false).unwrap();
        assert_eq!(parts[0].1.shape(), &[2, 1]);
        assert_abs_diff_eq!(parts[1].1[[1, 0]], 4.0);

        let down = filled(&[2, 3], |r, c| (r * 3 + c) as f32);
        let parts = element.split(&down, SplitFormat::I, true, false).unwrap();
        assert_eq!(parts[0].1.shape(), &[1, 3]);
        assert_abs_diff_eq!(parts[1].1[[0, 0]], 3.0);
    }

    #[test]
    fn test_input_split_and_diagonal_down() {
        let down = filled(&[2, 4], |r, c| if (r == 0) == (c < 2) { 1.0 } else { 0.0 });
        let even = ModelWeightElement::fused(names(2), SplitFormat::I);
        assert!(even.is_diagonal_down(&down));
        let parts = even.split(&down, SplitFormat::I, false, true).unwrap();
        assert_eq!(parts[0].1.shape(), &[1, 2]);

        let plain = even.split(&down, SplitFormat::I, false, false).unwrap();
        assert_eq!(plain[1].1.shape(), &[2, 2]);

        let up = filled(&[3, 2], |_, _| 1.0);
        let parts = even.split(&up, SplitFormat::O, false, true).unwrap();
        assert_eq!(parts[1].1.shape(), &[3, 1]);
        let shared = even.split(&up, SplitFormat::O, false, false).unwrap();
        assert!(shared.iter().all(|(_, p)| *p == up));
    }

    #[test]
    fn test_scale_applied_first() {
        let element = ModelWeightElement::single("a").with_scale(0.5);
        let t = filled(&[1, 2], |_, _| 4.0);
        let parts = element.split(&t, SplitFormat::O, false, false).unwrap();
        assert_abs_diff_eq!(parts[0].1[[0, 1]], 2.0);
    }

    #[test]
    fn test_fused_middle_block_is_diagonal() {
        // [3d, 3k] with only rows d..2d x cols k..2k populated.
        let (d, k) = (4, 2);
        let element = ModelWeightElement::fused(names(3), SplitFormat::O);
        let up = filled(&[3 * d, 3 * k], |r, c| {
            if (d..2 * d).contains(&r) && (k..2 * k).contains(&c) {
                0.5
            } else {
                0.0
            }
        });
        assert!(element.is_diagonal_up(&up));
    }

    #[test]
    fn test_diagonal_rejects_wrong_format_or_rank() {
        let element = ModelWeightElement::fused(names(3), SplitFormat::O);
        assert!(!element.is_diagonal_up(&filled(&[6, 4], |_, _| 0.0)));
        let input = ModelWeightElement::fused(names(3), SplitFormat::I);
        assert!(!input.is_diagonal_up(&filled(&[6, 3], |_, _| 0.0)));
        assert!(!element.is_diagonal_down(&filled(&[3, 6], |_, _| 0.0)));
    }

    #[test]
    fn test_validate_element() {
        let element =
            ModelWeightElement::fused(names(2), SplitFormat::O).with_offsets(vec![0, 3]);
        assert!(validate_element(&element, &[5, 2]).is_ok());
        assert!(validate_element(&element, &[3, 2]).is_err());
        let bad = ModelWeightElement::fused(names(2), SplitFormat::O).with_offsets(vec![2, 1]);
        assert!(validate_element(&bad, &[5, 2]).is_err());
        let uneven = ModelWeightElement::fused(names(2), SplitFormat::I);
        assert!(validate_element(&uneven, &[4, 3]).is_err());
    }

    proptest! {
        #[test]
        fn prop_single_nonzero_block_is_diagonal_iff_on_diagonal(
            count in 2usize..5,
            d in 1usize..4,
            k in 1usize..3,
            row_block in 0usize..5,
            col_block in 0usize..5,
        ) {
            let row_block = row_block % count;
            let col_block = col_block % count;
            let element = ModelWeightElement::fused(names(count), SplitFormat::O);
            let up = filled(&[count * d, count * k], |r, c| {
                if r / d == row_block && c / k == col_block { 1.0 } else { 0.0 }
            });
            prop_assert_eq!(element.is_diagonal_up(&up), row_block == col_block);
        }

        #[test]
        fn prop_output_split_preserves_rows(count in 1usize..5, rows_per in 1usize..4, cols in 1usize..4) {
            let element = ModelWeightElement::fused(names(count), SplitFormat::O);
            let t = filled(&[count * rows_per, cols], |r, c| (r * cols + c) as f32);
            let parts = element.split(&t, SplitFormat::O, false, false).unwrap();
            let total: usize = parts.iter().map(|(_, p)| p.shape()[0]).sum();
            prop_assert_eq!(total, count * rows_per);
        }
    }
}
