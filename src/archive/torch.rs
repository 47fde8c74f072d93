//! Zip-wrapped pickled checkpoints (`torch.save` format)
//!
//! The archive holds `<root>/data.pkl` with the object graph and one
//! `<root>/data/<key>` entry per storage. The object graph is decoded when
//! the archive is opened; storage entries are inflated on each read.

use super::convert::decode_values;
use super::pickle::{ObjectGraphDecoder, PickleValue, RestrictedUnpickler};
use super::{DataLocation, RootSelector, StateDict, TensorArchive, TensorDescriptor};
use crate::error::{Error, Result};
use crate::tensor::{self, Tensor};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

/// Zip archive with a pickled state dict.
pub struct TorchArchive {
    zip: Mutex<zip::ZipArchive<File>>,
    storages: HashMap<String, usize>,
}

impl std::fmt::Debug for TorchArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorchArchive")
            .field("storages", &self.storages.len())
            .finish()
    }
}

impl TorchArchive {
    /// Open `path`, decode its object graph and select the tensor root.
    pub fn open(path: &Path, root: RootSelector) -> Result<(Self, StateDict)> {
        Self::open_with(path, root, &RestrictedUnpickler)
    }

    /// Like [`TorchArchive::open`] with a caller-supplied object graph decoder.
    pub fn open_with(
        path: &Path,
        root: RootSelector,
        decoder: &dyn ObjectGraphDecoder,
    ) -> Result<(Self, StateDict)> {
        let file = File::open(path)?;
        let mut zip = zip::ZipArchive::new(file)?;

        let mut pickle_index = None;
        let mut storages = HashMap::new();
        for index in 0..zip.len() {
            let entry = zip.by_index(index)?;
            let name = entry.name().to_string();
            if name.ends_with("/data.pkl") || name == "data.pkl" {
                pickle_index = Some(index);
            } else if let Some((_, key)) = name.rsplit_once("/data/") {
                storages.insert(key.to_string(), index);
            }
        }
        let pickle_index = pickle_index.ok_or(Error::DataNotFound)?;

        let mut bytes = Vec::new();
        zip.by_index(pickle_index)?.read_to_end(&mut bytes)?;
        let graph = decoder.decode(&bytes)?;
        let state_dict = collect_tensors(select_root(&graph, root))?;

        Ok((
            Self {
                zip: Mutex::new(zip),
                storages,
            },
            state_dict,
        ))
    }

    fn read_storage(&self, key: &str) -> Result<Vec<u8>> {
        let index = *self
            .storages
            .get(key)
            .ok_or_else(|| Error::tensor_not_found(format!("storage {key}")))?;
        let mut zip = self.zip.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entry = zip.by_index(index)?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl TensorArchive for TorchArchive {
    fn read(&self, descriptor: &TensorDescriptor) -> Result<Tensor> {
        let DataLocation::Storage { name, offset } = &descriptor.location else {
            return Err(Error::InvalidHeader(format!(
                "{} does not address a storage",
                descriptor.key
            )));
        };
        let bytes = self.read_storage(name)?;
        let len = descriptor.numel() * descriptor.dtype.size();
        let end = offset + len;
        if end > bytes.len() {
            return Err(Error::Shape(format!(
                "{} needs bytes [{offset}, {end}) of a {}-byte storage",
                descriptor.key,
                bytes.len()
            )));
        }
        let values = decode_values(descriptor.dtype, &bytes[*offset..end]);
        tensor::from_shape_vec(&descriptor.shape, values)
    }
}

/// Pick the object holding the tensors for this kind of checkpoint.
fn select_root(graph: &PickleValue, root: RootSelector) -> &PickleValue {
    for name in root.candidates() {
        if let Some(value) = graph.get(name) {
            if root == RootSelector::Embedding {
                if let Some(inner) = value.get("_parameters") {
                    return inner;
                }
            }
            return value;
        }
    }
    graph
}

fn collect_tensors(root: &PickleValue) -> Result<StateDict> {
    let PickleValue::Dict(items) = root else {
        return Err(Error::Pickle("checkpoint root is not a dict".into()));
    };
    let mut state_dict = StateDict::new();
    for (key, value) in items {
        let (Some(key), PickleValue::Tensor(tensor)) = (key.as_str(), value) else {
            continue;
        };
        if !tensor.is_contiguous() {
            return Err(Error::UnsupportedModel(format!(
                "tensor {key} is not contiguous"
            )));
        }
        let shape = if tensor.shape.is_empty() {
            vec![1]
        } else {
            tensor.shape.clone()
        };
        state_dict.insert(
            key,
            TensorDescriptor {
                key: key.to_string(),
                shape,
                dtype: tensor.dtype,
                location: DataLocation::Storage {
                    name: tensor.storage.clone(),
                    offset: tensor.offset * tensor.dtype.size(),
                },
            },
        );
    }
    Ok(state_dict)
}
