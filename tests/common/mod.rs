//! Fixture helpers shared by the integration tests

#![allow(dead_code)]

use importar::archive::{DType, DataLocation, StateDict, TensorDescriptor};
use importar::tensor::{self, Tensor};
use safetensors::tensor::{Dtype, TensorView};
use std::collections::HashMap;
use std::path::Path;

/// Deterministic, non-trivial values for a tensor of `shape`.
pub fn values(shape: &[usize], seed: usize) -> Vec<f32> {
    let n: usize = shape.iter().product();
    (0..n).map(|i| ((i * 7 + seed * 13) % 11) as f32 * 0.1 - 0.5).collect()
}

/// Write f32 tensors to a safetensors file.
pub fn write_safetensors(path: &Path, tensors: &[(String, Vec<usize>, Vec<f32>)]) {
    write_safetensors_with_metadata(path, tensors, None);
}

pub fn write_safetensors_with_metadata(
    path: &Path,
    tensors: &[(String, Vec<usize>, Vec<f32>)],
    metadata: Option<HashMap<String, String>>,
) {
    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, shape, values)| {
            let bytes = bytemuck::cast_slice::<f32, u8>(values).to_vec();
            (name.clone(), shape.clone(), bytes)
        })
        .collect();
    let views: Vec<(&str, TensorView<'_>)> = encoded
        .iter()
        .map(|(name, shape, bytes)| {
            (name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap())
        })
        .collect();
    safetensors::serialize_to_file(views, &metadata, path).unwrap();
}

/// A low-rank pair plus alpha under `stem`.
pub fn lora_pair(stem: &str, out: usize, rank: usize, inp: usize, alpha: f32, seed: usize) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    vec![
        (format!("{stem}.lora_up.weight"), vec![out, rank], values(&[out, rank], seed)),
        (format!("{stem}.lora_down.weight"), vec![rank, inp], values(&[rank, inp], seed + 1)),
        (format!("{stem}.alpha"), vec![], vec![alpha]),
    ]
}

/// State dict of descriptors only, for detection tests.
pub fn descriptors(entries: &[(&str, &[usize])]) -> StateDict {
    let mut state_dict = StateDict::new();
    for (key, shape) in entries {
        state_dict.insert(
            *key,
            TensorDescriptor {
                key: key.to_string(),
                shape: shape.to_vec(),
                dtype: DType::F32,
                location: DataLocation::Range { start: 0, end: 0 },
            },
        );
    }
    state_dict
}

/// Product of two stored factors.
pub fn product(up: &Tensor, down: &Tensor) -> Tensor {
    tensor::matmul(up, down).unwrap()
}
