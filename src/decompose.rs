//! Adapter factor scaling and splitting onto canonical parameters.
//!
//! Three adapter kinds are supported:
//! - low rank: `delta = up · down`, with an optional `alpha` normalizer
//! - Hadamard (LoHa): `delta = (w1_a · w1_b) ⊙ (w2_a · w2_b)`
//! - dense diff: `delta` stored as is
//!
//! A global scale factor `k` is spread over the factors so that the
//! reconstructed delta is multiplied by exactly `k`: `sqrt(k)` on each low
//! rank factor and `k^(1/4)` on each of the four Hadamard factors.

use crate::error::{Error, Result};
use crate::mapping::{ModelWeightElement, SplitFormat};
use crate::tensor::{self, Tensor};

/// Adapter factors further than this from the rank count as rescaled.
const ALPHA_TOLERANCE: f32 = 1e-5;

/// Kind of weight delta an adapter carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoRAKind {
    LowRank,
    Hadamard,
    Diff,
}

/// `alpha / rank` when alpha is present and differs from the rank.
pub fn alpha_ratio(alpha: Option<f32>, rank: usize) -> f32 {
    match alpha {
        Some(alpha) if rank > 0 && (alpha - rank as f32).abs() > ALPHA_TOLERANCE => {
            alpha / rank as f32
        }
        _ => 1.0,
    }
}

/// Inner dimension of an up factor (`[out, rank, ...]`).
pub fn up_rank(up: &Tensor) -> usize {
    up.shape().get(1).copied().unwrap_or(1)
}

/// Low-rank factor pair.
#[derive(Debug, Clone, PartialEq)]
pub struct LoRAPair {
    pub up: Tensor,
    pub down: Tensor,
    pub alpha: Option<f32>,
}

impl LoRAPair {
    pub fn rank(&self) -> usize {
        up_rank(&self.up)
    }

    /// Up and down must agree on the rank axis.
    pub fn validate(&self) -> Result<()> {
        let down_rank = self.down.shape().first().copied().unwrap_or(0);
        if self.rank() != down_rank {
            return Err(Error::Shape(format!(
                "up {:?} and down {:?} disagree on rank",
                self.up.shape(),
                self.down.shape()
            )));
        }
        Ok(())
    }

    /// Reconstructed weight delta as a matrix.
    pub fn delta(&self) -> Result<Tensor> {
        self.validate()?;
        let product = tensor::matmul(&self.up, &self.down)?;
        Ok(tensor::scaled(&product, alpha_ratio(self.alpha, self.rank())))
    }
}

/// Hadamard-product adapter factors.
#[derive(Debug, Clone, PartialEq)]
pub struct HadamardFactors {
    pub w1_a: Tensor,
    pub w1_b: Tensor,
    pub w2_a: Tensor,
    pub w2_b: Tensor,
    pub alpha: Option<f32>,
}

impl HadamardFactors {
    /// Reconstructed weight delta as a matrix.
    pub fn delta(&self) -> Result<Tensor> {
        let first = tensor::matmul(&self.w1_a, &self.w1_b)?;
        let second = tensor::matmul(&self.w2_a, &self.w2_b)?;
        if first.shape() != second.shape() {
            return Err(Error::Shape(format!(
                "Hadamard halves {:?} and {:?} differ",
                first.shape(),
                second.shape()
            )));
        }
        let ratio = alpha_ratio(self.alpha, up_rank(&self.w1_a));
        Ok((first * second).mapv(|v| v * ratio))
    }
}

/// Factor split onto canonical names.
#[derive(Debug, Clone)]
pub struct Factor {
    pub parts: Vec<(String, Tensor)>,
    /// The factor touched exactly one block of a fused target.
    pub is_diagonal: bool,
}

/// Applies scaling and diagonal handling for one import.
#[derive(Debug, Clone, Copy)]
pub struct Decomposer {
    scale_factor: f32,
}

impl Default for Decomposer {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Decomposer {
    pub fn new(scale_factor: f32) -> Self {
        Self { scale_factor }
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    /// Multiplier of an up factor: `alpha / rank · sqrt(k)`.
    pub fn up_multiplier(&self, alpha: Option<f32>, rank: usize) -> f32 {
        alpha_ratio(alpha, rank) * self.scale_factor.sqrt()
    }

    /// Multiplier of a down or mid factor: `sqrt(k)`.
    pub fn down_multiplier(&self) -> f32 {
        self.scale_factor.sqrt()
    }

    /// Multiplier of `hada_w1_a` / `hada_w2_a`: `sqrt(alpha / rank) · k^(1/4)`.
    pub fn hada_a_multiplier(&self, alpha: Option<f32>, rank: usize) -> f32 {
        alpha_ratio(alpha, rank).sqrt() * self.scale_factor.powf(0.25)
    }

    /// Multiplier of `hada_w1_b` / `hada_w2_b`: `k^(1/4)`.
    pub fn hada_b_multiplier(&self) -> f32 {
        self.scale_factor.powf(0.25)
    }

    fn apply(tensor: &Tensor, multiplier: f32) -> Tensor {
        if multiplier == 1.0 {
            tensor.clone()
        } else {
            tensor::scaled(tensor, multiplier)
        }
    }

    /// Scale an up factor and split it onto the element's names.
    ///
    /// Fused output-packed targets are checked for a block-diagonal up
    /// factor, which is then split into per-block tensors.
    pub fn up(&self, element: &ModelWeightElement, up: &Tensor, alpha: Option<f32>) -> Result<Factor> {
        let up = Self::apply(up, self.up_multiplier(alpha, up_rank(up)));
        let is_diagonal = element.count() > 1 && element.is_diagonal_up(&tensor::as_matrix(&up)?);
        let parts = element.split(&up, SplitFormat::O, is_diagonal, false)?;
        Ok(Factor { parts, is_diagonal })
    }

    /// Scale a down factor and split it onto the element's names.
    ///
    /// `diagonal_up` is the result recorded for the matching up factor.
    pub fn down(&self, element: &ModelWeightElement, down: &Tensor, diagonal_up: bool) -> Result<Factor> {
        let down = Self::apply(down, self.down_multiplier());
        let is_diagonal =
            element.count() > 1 && element.is_diagonal_down(&tensor::as_matrix(&down)?);
        let parts = element.split(&down, SplitFormat::I, diagonal_up, is_diagonal)?;
        Ok(Factor { parts, is_diagonal })
    }

    /// Up factor of an input-packed target whose down factor proved
    /// block-diagonal, split by rank columns.
    pub fn redefined_up(
        &self,
        element: &ModelWeightElement,
        up: &Tensor,
        alpha: Option<f32>,
    ) -> Result<Vec<(String, Tensor)>> {
        let up = Self::apply(up, self.up_multiplier(alpha, up_rank(up)));
        element.split(&up, SplitFormat::O, false, true)
    }

    /// Mid factor of a convolutional adapter, shared by every name.
    pub fn mid(&self, element: &ModelWeightElement, mid: &Tensor) -> Vec<(String, Tensor)> {
        shared(element, &Self::apply(mid, self.down_multiplier()))
    }

    /// `hada_w1_a` or `hada_w2_a`, shared by every name.
    pub fn hada_a(
        &self,
        element: &ModelWeightElement,
        factor: &Tensor,
        alpha: Option<f32>,
    ) -> Vec<(String, Tensor)> {
        let multiplier = self.hada_a_multiplier(alpha, up_rank(factor));
        shared(element, &Self::apply(factor, multiplier))
    }

    /// `hada_w1_b` or `hada_w2_b`, shared by every name.
    pub fn hada_b(&self, element: &ModelWeightElement, factor: &Tensor) -> Vec<(String, Tensor)> {
        shared(element, &Self::apply(factor, self.hada_b_multiplier()))
    }

    /// Dense delta, scaled by `k` and split like a full weight.
    pub fn diff(&self, element: &ModelWeightElement, delta: &Tensor) -> Result<Vec<(String, Tensor)>> {
        let delta = Self::apply(delta, self.scale_factor);
        element.split(&delta, SplitFormat::O, false, false)
    }
}

fn shared(element: &ModelWeightElement, tensor: &Tensor) -> Vec<(String, Tensor)> {
    element
        .names
        .iter()
        .map(|name| (name.clone(), tensor.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::from_shape_vec;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    fn matrix(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f32) -> Tensor {
        let values = (0..rows * cols).map(|k| f(k / cols, k % cols)).collect();
        from_shape_vec(&[rows, cols], values).unwrap()
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{i}.weight")).collect()
    }

    #[test]
    fn test_alpha_ratio() {
        assert_eq!(alpha_ratio(None, 8), 1.0);
        assert_eq!(alpha_ratio(Some(8.0), 8), 1.0);
        assert_eq!(alpha_ratio(Some(8.0 + 1e-6), 8), 1.0);
        assert_abs_diff_eq!(alpha_ratio(Some(4.0), 8), 0.5);
    }

    #[test]
    fn test_unscaled_when_alpha_equals_rank() {
        let element = ModelWeightElement::single("attn2.to_k.weight");
        let up = matrix(2048, 8, |r, c| (r + c) as f32 * 1e-3);
        let factor = Decomposer::default().up(&element, &up, Some(8.0)).unwrap();
        assert!(!factor.is_diagonal);
        assert_eq!(factor.parts.len(), 1);
        assert_eq!(factor.parts[0].1, up);
    }

    #[test]
    fn test_fused_up_middle_block_is_diagonal() {
        let (d, r) = (4, 2);
        let element = ModelWeightElement::fused(names(3), SplitFormat::O);
        let up = matrix(3 * d, 3 * r, |row, col| {
            if (d..2 * d).contains(&row) && (r..2 * r).contains(&col) {
                1.0
            } else {
                0.0
            }
        });
        let factor = Decomposer::default().up(&element, &up, None).unwrap();
        assert!(factor.is_diagonal);
        assert_eq!(factor.parts[1].1.shape(), &[d, r]);
        assert!(factor.parts[1].1.iter().all(|&v| v == 1.0));

        let mut leaked = up.clone();
        leaked[[0, 5]] = 0.25;
        let factor = Decomposer::default().up(&element, &leaked, None).unwrap();
        assert!(!factor.is_diagonal);
        assert_eq!(factor.parts[0].1.shape(), &[d, 3 * r]);
    }

    #[test]
    fn test_down_follows_up_diagonal() {
        let element = ModelWeightElement::fused(names(2), SplitFormat::O);
        let down = matrix(4, 3, |r, _| r as f32);
        let decomposer = Decomposer::default();
        let split = decomposer.down(&element, &down, true).unwrap();
        assert_eq!(split.parts[1].1.shape(), &[2, 3]);
        let shared = decomposer.down(&element, &down, false).unwrap();
        assert!(shared.parts.iter().all(|(_, t)| *t == down));
    }

    #[test]
    fn test_input_packed_diagonal_down_and_redefined_up() {
        let element = ModelWeightElement::fused(names(2), SplitFormat::I).with_offsets(vec![0, 3]);
        let down = matrix(4, 5, |r, c| if (r < 2) == (c < 3) { 1.0 } else { 0.0 });
        let decomposer = Decomposer::default();
        let factor = decomposer.down(&element, &down, false).unwrap();
        assert!(factor.is_diagonal);
        assert_eq!(factor.parts[0].1.shape(), &[2, 3]);
        assert_eq!(factor.parts[1].1.shape(), &[2, 2]);

        let up = matrix(6, 4, |_, c| c as f32);
        let parts = decomposer.redefined_up(&element, &up, None).unwrap();
        assert_eq!(parts[1].1.shape(), &[6, 2]);
        assert_abs_diff_eq!(parts[1].1[[0, 0]], 2.0);
    }

    #[test]
    fn test_pair_validation() {
        let pair = LoRAPair {
            up: matrix(4, 2, |_, _| 1.0),
            down: matrix(3, 4, |_, _| 1.0),
            alpha: None,
        };
        assert!(pair.validate().is_err());
    }

    fn small_matrix(rows: usize, cols: usize) -> impl Strategy<Value = Tensor> {
        prop::collection::vec(-1.0f32..1.0, rows * cols)
            .prop_map(move |values| from_shape_vec(&[rows, cols], values).unwrap())
    }

    proptest! {
        #[test]
        fn prop_low_rank_scale_invariance(
            up in small_matrix(6, 2),
            down in small_matrix(2, 5),
            alpha in prop::option::of(0.5f32..16.0),
            k in 0.1f32..4.0,
        ) {
            let element = ModelWeightElement::single("w.weight");
            let product = |scale: f32| {
                let decomposer = Decomposer::new(scale);
                let up = decomposer.up(&element, &up, alpha).unwrap().parts.remove(0).1;
                let down = decomposer.down(&element, &down, false).unwrap().parts.remove(0).1;
                tensor::matmul(&up, &down).unwrap()
            };
            let base = product(1.0);
            let scaled = product(k);
            for (a, b) in base.iter().zip(scaled.iter()) {
                prop_assert!((a * k - b).abs() <= 1e-4 * (1.0 + a.abs() * k));
            }
        }

        #[test]
        fn prop_hadamard_scale_invariance(
            w1_a in small_matrix(4, 2),
            w1_b in small_matrix(2, 3),
            w2_a in small_matrix(4, 2),
            w2_b in small_matrix(2, 3),
            alpha in prop::option::of(0.5f32..8.0),
            k in 0.1f32..4.0,
        ) {
            let element = ModelWeightElement::single("w.weight");
            let delta = |scale: f32| {
                let decomposer = Decomposer::new(scale);
                let first = |t: &Tensor| decomposer.hada_a(&element, t, alpha).remove(0).1;
                let second = |t: &Tensor| decomposer.hada_b(&element, t).remove(0).1;
                HadamardFactors {
                    w1_a: first(&w1_a),
                    w1_b: second(&w1_b),
                    w2_a: first(&w2_a),
                    w2_b: second(&w2_b),
                    alpha: None,
                }
                .delta()
                .unwrap()
            };
            let reference = HadamardFactors {
                w1_a: w1_a.clone(),
                w1_b: w1_b.clone(),
                w2_a: w2_a.clone(),
                w2_b: w2_b.clone(),
                alpha,
            }
            .delta()
            .unwrap();
            let base = delta(1.0);
            let scaled = delta(k);
            for ((a, b), r) in base.iter().zip(scaled.iter()).zip(reference.iter()) {
                prop_assert!((a - r).abs() <= 1e-4 * (1.0 + r.abs()));
                prop_assert!((a * k - b).abs() <= 1e-4 * (1.0 + a.abs() * k));
            }
        }
    }
}
