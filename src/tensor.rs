//! Dense f32 tensors and the slicing helpers the importers need.
//!
//! Every decoded tensor is widened to f32 and held as an [`ndarray::ArrayD`].
//! Precision is narrowed again only when written to the store.

use crate::error::{Error, Result};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use std::ops::Range;

/// Dense, row-major tensor of f32 values.
pub type Tensor = ArrayD<f32>;

/// Build a tensor from a shape and row-major values.
pub fn from_shape_vec(shape: &[usize], values: Vec<f32>) -> Result<Tensor> {
    Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?)
}

/// Scalar stored as a one-element tensor.
pub fn scalar(value: f32) -> Tensor {
    ArrayD::from_elem(IxDyn(&[1]), value)
}

/// First element of a tensor, used for alpha scalars.
pub fn first_value(tensor: &Tensor) -> Option<f32> {
    tensor.iter().next().copied()
}

/// Copy of `tensor` with every size-1 dimension removed.
///
/// A tensor made only of size-1 dimensions keeps a single dimension.
pub fn squeezed(tensor: &Tensor) -> Tensor {
    let shape: Vec<usize> = tensor.shape().iter().copied().filter(|&d| d != 1).collect();
    let shape = if shape.is_empty() { vec![1] } else { shape };
    reshaped(tensor, &shape).unwrap_or_else(|_| tensor.clone())
}

/// Copy of `tensor` with a new shape holding the same number of elements.
pub fn reshaped(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let values: Vec<f32> = tensor.iter().copied().collect();
    from_shape_vec(shape, values)
}

/// Multiply every element by `factor`.
pub fn scaled(tensor: &Tensor, factor: f32) -> Tensor {
    tensor.mapv(|v| v * factor)
}

/// Owned slice along `axis`.
pub fn slice_axis(tensor: &Tensor, axis: usize, range: Range<usize>) -> Result<Tensor> {
    check_range(tensor, axis, &range)?;
    Ok(tensor
        .slice_axis(Axis(axis), Slice::from(range.start..range.end))
        .to_owned())
}

/// Copy with the axis order reversed; rows and columns swap for a matrix.
pub fn transposed(tensor: &Tensor) -> Tensor {
    tensor.t().as_standard_layout().into_owned()
}

/// Owned sub-block `rows × cols` of a tensor with at least two dimensions.
pub fn block(tensor: &Tensor, rows: Range<usize>, cols: Range<usize>) -> Result<Tensor> {
    let rows = slice_axis(tensor, 0, rows)?;
    slice_axis(&rows, 1, cols)
}

/// Concatenate tensors along an existing axis.
pub fn concatenate(axis: usize, tensors: &[Tensor]) -> Result<Tensor> {
    let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
    Ok(ndarray::concatenate(Axis(axis), &views)?)
}

/// Place 2-D tensors on the diagonal of a zero matrix.
///
/// Trailing dimensions beyond the second are flattened into the columns.
pub fn block_diagonal(tensors: &[Tensor]) -> Result<Tensor> {
    let matrices: Vec<Tensor> = tensors.iter().map(as_matrix).collect::<Result<_>>()?;
    let rows: usize = matrices.iter().map(|m| m.shape()[0]).sum();
    let cols: usize = matrices.iter().map(|m| m.shape()[1]).sum();
    let mut out = ArrayD::<f32>::zeros(IxDyn(&[rows, cols]));
    let (mut r, mut c) = (0, 0);
    for m in &matrices {
        let (h, w) = (m.shape()[0], m.shape()[1]);
        out.slice_axis_mut(Axis(0), Slice::from(r..r + h))
            .slice_axis_mut(Axis(1), Slice::from(c..c + w))
            .assign(m);
        r += h;
        c += w;
    }
    Ok(out)
}

/// View a tensor as `[shape[0], product(rest)]`.
pub fn as_matrix(tensor: &Tensor) -> Result<Tensor> {
    let shape = tensor.shape();
    match shape.len() {
        0 => reshaped(tensor, &[1, 1]),
        1 => reshaped(tensor, &[shape[0], 1]),
        2 => Ok(tensor.clone()),
        _ => {
            let rest: usize = shape[1..].iter().product();
            reshaped(tensor, &[shape[0], rest])
        }
    }
}

/// Whether every element in the slice is exactly zero.
pub fn all_zero(tensor: &Tensor) -> bool {
    tensor.iter().all(|&v| v == 0.0)
}

/// Matrix product of two tensors viewed as matrices.
pub fn matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let lhs = as_matrix(lhs)?.into_dimensionality::<ndarray::Ix2>()?;
    let rhs = as_matrix(rhs)?.into_dimensionality::<ndarray::Ix2>()?;
    if lhs.shape()[1] != rhs.shape()[0] {
        return Err(Error::Shape(format!(
            "cannot multiply {:?} by {:?}",
            lhs.shape(),
            rhs.shape()
        )));
    }
    Ok(lhs.dot(&rhs).into_dyn())
}

fn check_range(tensor: &Tensor, axis: usize, range: &Range<usize>) -> Result<()> {
    let Some(&dim) = tensor.shape().get(axis) else {
        return Err(Error::Shape(format!(
            "axis {axis} out of bounds for shape {:?}",
            tensor.shape()
        )));
    };
    if range.start > range.end || range.end > dim {
        return Err(Error::Shape(format!(
            "range {range:?} out of bounds for axis {axis} of shape {:?}",
            tensor.shape()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn arange(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        from_shape_vec(shape, (0..n).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_squeezed_drops_unit_dims() {
        let t = arange(&[4, 3, 1, 1]);
        assert_eq!(squeezed(&t).shape(), &[4, 3]);

        let t = arange(&[1, 1]);
        assert_eq!(squeezed(&t).shape(), &[1]);
    }

    #[test]
    fn test_block_extracts_sub_matrix() {
        let t = arange(&[4, 4]);
        let b = block(&t, 1..3, 2..4).unwrap();
        assert_eq!(b.shape(), &[2, 2]);
        assert_abs_diff_eq!(b[[0, 0]], 6.0);
        assert_abs_diff_eq!(b[[1, 1]], 11.0);
    }

    #[test]
    fn test_slice_out_of_bounds_is_error() {
        let t = arange(&[4, 4]);
        assert!(slice_axis(&t, 0, 2..5).is_err());
        assert!(slice_axis(&t, 2, 0..1).is_err());
    }

    #[test]
    fn test_block_diagonal_layout() {
        let a = arange(&[2, 1]);
        let b = arange(&[1, 2]);
        let d = block_diagonal(&[a, b]).unwrap();
        assert_eq!(d.shape(), &[3, 3]);
        assert_abs_diff_eq!(d[[1, 0]], 1.0);
        assert_abs_diff_eq!(d[[2, 2]], 1.0);
        assert_abs_diff_eq!(d[[0, 1]], 0.0);
        assert_abs_diff_eq!(d[[2, 0]], 0.0);
    }

    #[test]
    fn test_matmul_shapes() {
        let a = arange(&[2, 3]);
        let b = arange(&[3, 1]);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 1]);
        assert_abs_diff_eq!(c[[0, 0]], 5.0);
        assert!(matmul(&a, &a).is_err());
    }
}
