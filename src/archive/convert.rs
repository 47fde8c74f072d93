//! Raw little-endian bytes to f32 conversion

use super::DType;

/// Widen raw little-endian tensor bytes to f32 values.
///
/// Trailing bytes that do not form a whole element are ignored.
pub(crate) fn decode_values(dtype: DType, data: &[u8]) -> Vec<f32> {
    match dtype {
        DType::F32 => data
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
        DType::F16 => data
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
                half::f16::from_bits(bits).to_f32()
            })
            .collect(),
        DType::BF16 => data
            .chunks_exact(2)
            .map(|chunk| {
                let bits = u16::from_le_bytes([chunk[0], chunk[1]]);
                half::bf16::from_bits(bits).to_f32()
            })
            .collect(),
        DType::F64 => data
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                f64::from_le_bytes(bytes) as f32
            })
            .collect(),
    }
}
