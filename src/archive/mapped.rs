//! Memory-mapped header+blob tensor files
//!
//! Layout: an 8-byte little-endian header length, a JSON header of
//! `{name: {dtype, shape, data_offsets: [start, end]}}`, then the raw blob.
//! Only the header is parsed at open; tensor bytes are decoded on demand.

use super::convert::decode_values;
use super::{DType, DataLocation, StateDict, TensorArchive, TensorDescriptor};
use crate::error::{Error, Result};
use crate::tensor::{self, Tensor};
use std::fs::File;
use std::path::Path;

/// Headers at or above this size are rejected.
const MAX_HEADER_SIZE: u64 = 10 * 1024 * 1024;

/// Lazily decoded header+blob tensor file.
#[derive(Debug)]
pub struct SafeTensorsArchive {
    mmap: memmap2::Mmap,
    data_offset: usize,
}

impl SafeTensorsArchive {
    /// Map `path` and parse its header into a [`StateDict`].
    pub fn open(path: &Path) -> Result<(Self, StateDict)> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and the file is not expected to
        // change while an import holds it open.
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
        let (data_offset, state_dict) = parse_header(&mmap)?;
        Ok((Self { mmap, data_offset }, state_dict))
    }

    fn blob(&self) -> &[u8] {
        &self.mmap[self.data_offset..]
    }
}

impl TensorArchive for SafeTensorsArchive {
    fn read(&self, descriptor: &TensorDescriptor) -> Result<Tensor> {
        let DataLocation::Range { start, end } = descriptor.location else {
            return Err(Error::InvalidHeader(format!(
                "{} does not address the blob section",
                descriptor.key
            )));
        };
        let blob = self.blob();
        if end > blob.len() || start >= end {
            return Err(Error::InvalidHeader(format!(
                "{} has data offsets [{start}, {end}) outside the blob",
                descriptor.key
            )));
        }
        let values = decode_values(descriptor.dtype, &blob[start..end]);
        if values.len() != descriptor.numel() {
            return Err(Error::Shape(format!(
                "{} holds {} values but shape {:?} needs {}",
                descriptor.key,
                values.len(),
                descriptor.shape,
                descriptor.numel()
            )));
        }
        tensor::from_shape_vec(&descriptor.shape, values)
    }
}

/// Parse the length-prefixed JSON header.
///
/// Returns the blob offset and the descriptors of every acceptable entry.
///
/// The header is read with `serde_json` rather than
/// `safetensors::SafeTensors::read_metadata`, which fails the whole file on
/// lowercase or aliased dtypes (`float32`, `half`), on `__`-prefixed keys
/// other than `__metadata__`, and on gaps between entries or trailing blob
/// bytes. Here `__` keys are skipped and unreadable entries are dropped one by
/// one.
pub(crate) fn parse_header(bytes: &[u8]) -> Result<(usize, StateDict)> {
    if bytes.len() < 8 {
        return Err(Error::InvalidHeader(format!(
            "file too small: {} bytes",
            bytes.len()
        )));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[..8]);
    let header_size = u64::from_le_bytes(len_bytes);
    if header_size == 0 || header_size >= MAX_HEADER_SIZE {
        return Err(Error::InvalidHeader(format!(
            "header size {header_size} out of range"
        )));
    }
    let header_end = 8 + header_size as usize;
    if header_end > bytes.len() {
        return Err(Error::InvalidHeader(format!(
            "header size {header_size} exceeds file size {}",
            bytes.len()
        )));
    }
    let header: serde_json::Value = serde_json::from_slice(&bytes[8..header_end])?;
    let entries = header
        .as_object()
        .ok_or_else(|| Error::InvalidHeader("header is not a JSON object".into()))?;
    let blob_len = bytes.len() - header_end;

    let mut state_dict = StateDict::new();
    for (key, entry) in entries {
        if key.starts_with("__") {
            continue;
        }
        match parse_entry(key, entry, blob_len) {
            Some(descriptor) => {
                state_dict.insert(key.clone(), descriptor);
            }
            None => tracing::debug!(key = %key, "skipping unreadable header entry"),
        }
    }
    Ok((header_end, state_dict))
}

fn parse_entry(key: &str, entry: &serde_json::Value, blob_len: usize) -> Option<TensorDescriptor> {
    let dtype = DType::parse(entry.get("dtype")?.as_str()?)?;
    let dims = entry.get("shape")?.as_array()?;
    let mut shape = Vec::with_capacity(dims.len());
    for dim in dims {
        let dim = dim.as_i64()?;
        if dim <= 0 {
            return None;
        }
        shape.push(dim as usize);
    }
    if shape.is_empty() {
        shape.push(1);
    }
    let offsets = entry.get("data_offsets")?.as_array()?;
    if offsets.len() != 2 {
        return None;
    }
    let start = offsets[0].as_u64()? as usize;
    let end = offsets[1].as_u64()? as usize;
    if end <= start || end > blob_len {
        return None;
    }
    Some(TensorDescriptor {
        key: key.to_string(),
        shape,
        dtype,
        location: DataLocation::Range { start, end },
    })
}
