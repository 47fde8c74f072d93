//! Uniform read access over checkpoint containers
//!
//! Two container formats are supported:
//! - Header+blob tensor files (safetensors layout), memory mapped and
//!   decoded lazily per tensor
//! - Zip archives holding a pickled `state_dict` plus raw storage blobs,
//!   whose object graph is decoded eagerly by a restricted interpreter
//!
//! Both expose the same [`TensorArchive`] contract and produce a
//! [`StateDict`] of [`TensorDescriptor`]s.

mod convert;
mod mapped;
mod pickle;
mod torch;


use crate::error::{Error, Result};
use crate::session::ImportSession;
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::path::Path;

pub(crate) use convert::decode_values;
pub use mapped::SafeTensorsArchive;
pub use pickle::{ObjectGraphDecoder, PickleValue, RestrictedUnpickler};
pub use torch::TorchArchive;

/// Element type of a stored tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Parse a header dtype string, accepting common aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f16" | "float16" | "half" => Some(DType::F16),
            "bf16" | "bfloat16" => Some(DType::BF16),
            "f32" | "float32" | "float" => Some(DType::F32),
            "f64" | "float64" | "double" => Some(DType::F64),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

/// Where a tensor's bytes live inside its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLocation {
    /// Byte range relative to the start of the blob section.
    Range { start: usize, end: usize },
    /// Named storage entry plus a byte offset into it.
    Storage { name: String, offset: usize },
}

/// Immutable description of one tensor in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub key: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub location: DataLocation,
}

impl TensorDescriptor {
    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Trailing dimension, used by most version fingerprints.
    pub fn last_dim(&self) -> Option<usize> {
        self.shape.last().copied()
    }
}

/// Key to descriptor mapping for one import.
///
/// Aliases can be added but entries are never removed or replaced.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: BTreeMap<String, TensorDescriptor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry if the key is not yet present.
    ///
    /// Returns `true` when the entry was added.
    pub fn insert(&mut self, key: impl Into<String>, descriptor: TensorDescriptor) -> bool {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, descriptor);
        true
    }

    /// Add `alias` pointing at the descriptor of `existing`.
    pub fn alias(&mut self, alias: impl Into<String>, existing: &str) -> bool {
        match self.entries.get(existing).cloned() {
            Some(descriptor) => self.insert(alias, descriptor),
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&TensorDescriptor> {
        self.entries.get(key)
    }

    /// Descriptor for `key` or [`Error::TensorNotFound`].
    pub fn require(&self, key: &str) -> Result<&TensorDescriptor> {
        self.get(key).ok_or_else(|| Error::tensor_not_found(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorDescriptor)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Snapshot of keys, for rewrites that add aliases while scanning.
    pub fn key_snapshot(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any key contains `needle`.
    pub fn any_key_contains(&self, needle: &str) -> bool {
        self.keys().any(|k| k.contains(needle))
    }

    /// Whether any key starts with `prefix`.
    pub fn any_key_starts_with(&self, prefix: &str) -> bool {
        self.keys().any(|k| k.starts_with(prefix))
    }
}

/// Read access to the tensors of an opened container.
pub trait TensorArchive {
    /// Decode the tensor a descriptor points at, widened to f32.
    fn read(&self, descriptor: &TensorDescriptor) -> Result<Tensor>;
}

/// Session-aware helpers layered on every [`TensorArchive`].
pub trait TensorArchiveExt: TensorArchive {
    /// Decode one tensor and hand it to `f`.
    ///
    /// The session is polled first, so a cancelled import fails with
    /// [`Error::Interrupted`] before any bytes are decoded.
    fn with<T>(
        &self,
        descriptor: &TensorDescriptor,
        session: &mut ImportSession,
        f: impl FnOnce(Tensor) -> Result<T>,
    ) -> Result<T> {
        session.poll()?;
        let tensor = self.read(descriptor)?;
        f(tensor)
    }
}

impl<A: TensorArchive + ?Sized> TensorArchiveExt for A {}

/// Which object in a pickled checkpoint holds the tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSelector {
    /// `state_dict`, then `module`, then the root object.
    FullModel,
    /// `state_dict`, then the root object.
    Adapter,
    /// `state_dict`, then `params_ema`, then `params`, then the root object.
    Upscaler,
    /// `string_to_param` (and its `_parameters`), then the root object.
    Embedding,
}

impl RootSelector {
    pub(crate) fn candidates(self) -> &'static [&'static str] {
        match self {
            RootSelector::FullModel => &["state_dict", "module"],
            RootSelector::Adapter => &["state_dict"],
            RootSelector::Upscaler => &["state_dict", "params_ema", "params"],
            RootSelector::Embedding => &["string_to_param"],
        }
    }
}

/// An opened archive and the state dict it exposes.
pub struct OpenedArchive {
    pub archive: Box<dyn TensorArchive>,
    pub state_dict: StateDict,
}

impl std::fmt::Debug for OpenedArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedArchive")
            .field("tensors", &self.state_dict.len())
            .finish()
    }
}

/// Open a checkpoint, trying the header+blob format before the zip format.
///
/// Fails with [`Error::DataNotFound`] when neither signature is recognized.
pub fn open_archive(path: impl AsRef<Path>, root: RootSelector) -> Result<OpenedArchive> {
    let path = path.as_ref();
    match SafeTensorsArchive::open(path) {
        Ok((archive, state_dict)) => {
            tracing::debug!(path = %path.display(), tensors = state_dict.len(), "opened safetensors archive");
            return Ok(OpenedArchive {
                archive: Box::new(archive),
                state_dict,
            });
        }
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Io(err))
        }
        Err(err) => tracing::debug!(error = %err, "not a safetensors archive"),
    }
    match TorchArchive::open(path, root) {
        Ok((archive, state_dict)) => {
            tracing::debug!(path = %path.display(), tensors = state_dict.len(), "opened pickled archive");
            Ok(OpenedArchive {
                archive: Box::new(archive),
                state_dict,
            })
        }
        Err(Error::Interrupted) => Err(Error::Interrupted),
        Err(err) => {
            tracing::debug!(error = %err, "not a pickled zip archive");
            Err(Error::DataNotFound)
        }
    }
}
