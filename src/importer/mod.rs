//! Per-asset import drivers
//!
//! Each driver opens an archive, classifies it, resolves its mapping tables
//! and writes the converted tensors into a [`TensorStore`] inside one
//! transaction. Progress and cancellation flow through the caller's
//! [`ImportSession`](crate::session::ImportSession).

mod controlnet;
mod embedding;
mod lora;
mod model;
mod upscaler;

pub use controlnet::{import_controlnet, ControlNetImport, CONTROLNET_SUBMODELS};
pub use embedding::{import_embedding, EmbeddingImport, EMBEDDING_PARTS, EMBEDDING_SUBMODEL};
pub use lora::{import_lora, import_lora_state_dict, LoRAImport};
pub use model::{import_model, ModelImport};
pub use upscaler::{import_upscaler, UpscalerImport, UPSCALER_SUBMODEL};

use crate::archive::{StateDict, TensorArchive, TensorArchiveExt, TensorDescriptor};
use crate::error::Result;
use crate::mapping::{ModelWeightElement, ModelWeightMapping, SplitFormat};
use crate::session::ImportSession;
use crate::store::{store_key, StoreTransaction};
use serde::Serialize;
use std::collections::HashSet;

/// Adapter keys that matched no mapping table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkippedKeys {
    pub count: usize,
    /// The keys themselves, kept only when `report_skipped` is set.
    pub keys: Vec<String>,
}

impl SkippedKeys {
    pub(crate) fn record(&mut self, key: &str, keep: bool) {
        self.count += 1;
        if keep {
            self.keys.push(key.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Present table entries, one per canonical target.
///
/// Aliases of one target are de-duplicated; the first present key wins.
pub(crate) fn present_entries<'a>(
    table: &'a ModelWeightMapping,
    state_dict: &'a StateDict,
) -> Vec<(&'a ModelWeightElement, &'a TensorDescriptor)> {
    let mut seen: HashSet<&[String]> = HashSet::new();
    table
        .iter()
        .filter_map(|(key, element)| state_dict.get(key).map(|descriptor| (element, descriptor)))
        .filter(|(element, _)| seen.insert(element.names.as_slice()))
        .collect()
}

/// Write full weights of every present entry of `table` under `submodel`.
///
/// Returns the number of tensors written.
pub(crate) fn write_table(
    archive: &dyn TensorArchive,
    state_dict: &StateDict,
    table: &ModelWeightMapping,
    submodel: &str,
    tx: &mut StoreTransaction<'_>,
    session: &mut ImportSession,
) -> Result<usize> {
    let mut written = 0;
    for (element, descriptor) in present_entries(table, state_dict) {
        let weight = archive.with(descriptor, session, Ok)?;
        for (name, part) in element.split(&weight, SplitFormat::O, false, false)? {
            tx.write(&store_key(submodel, &name, None), &part)?;
            written += 1;
        }
    }
    tracing::debug!(submodel, written, "wrote table");
    Ok(written)
}

/// Number of distinct table targets present in the state dict.
pub(crate) fn present_count(table: &ModelWeightMapping, state_dict: &StateDict) -> usize {
    present_entries(table, state_dict).len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{DType, DataLocation};
    use crate::store::TensorStore;
    use crate::tensor::{from_shape_vec, Tensor};
    use std::collections::HashMap;

    /// Archive serving tensors from memory, keyed by descriptor key.
    pub(crate) struct MemoryArchive(pub HashMap<String, Tensor>);

    impl TensorArchive for MemoryArchive {
        fn read(&self, descriptor: &TensorDescriptor) -> Result<Tensor> {
            self.0
                .get(&descriptor.key)
                .cloned()
                .ok_or_else(|| crate::Error::tensor_not_found(&descriptor.key))
        }
    }

    fn descriptor(key: &str, shape: &[usize]) -> TensorDescriptor {
        TensorDescriptor {
            key: key.into(),
            shape: shape.to_vec(),
            dtype: DType::F32,
            location: DataLocation::Range { start: 0, end: 0 },
        }
    }

    #[test]
    fn test_write_table_dedupes_aliases_and_splits_fusions() {
        let mut table = ModelWeightMapping::new();
        table.insert("a".into(), ModelWeightElement::single("x"));
        table.insert("b".into(), ModelWeightElement::single("x"));
        table.insert(
            "qkv".into(),
            ModelWeightElement::fused(vec!["q".into(), "k".into(), "v".into()], SplitFormat::O),
        );
        table.insert("absent".into(), ModelWeightElement::single("y"));

        let mut state_dict = StateDict::new();
        let mut tensors = HashMap::new();
        for (key, shape, offset) in [("a", vec![2], 0.0), ("b", vec![2], 10.0), ("qkv", vec![3, 2], 0.0)] {
            state_dict.insert(key, descriptor(key, &shape));
            let n: usize = shape.iter().product();
            tensors.insert(
                key.to_string(),
                from_shape_vec(&shape, (0..n).map(|v| v as f32 + offset).collect()).unwrap(),
            );
        }
        let archive = MemoryArchive(tensors);
        assert_eq!(present_count(&table, &state_dict), 2);

        let mut store = TensorStore::open_in_memory().unwrap();
        let mut session = ImportSession::new();
        let written = store
            .with_transaction(|tx| {
                write_table(&archive, &state_dict, &table, "unet", tx, &mut session)
            })
            .unwrap();
        assert_eq!(written, 4);
        assert_eq!(
            store.read("__unet__[x]").unwrap().unwrap(),
            from_shape_vec(&[2], vec![0.0, 1.0]).unwrap()
        );
        assert_eq!(
            store.read("__unet__[k]").unwrap().unwrap(),
            from_shape_vec(&[1, 2], vec![2.0, 3.0]).unwrap()
        );
        assert_eq!(session.accessed(), 2);
    }

    #[test]
    fn test_skipped_keys_respects_report_flag() {
        let mut skipped = SkippedKeys::default();
        skipped.record("a", false);
        skipped.record("b", true);
        assert_eq!(skipped.count, 2);
        assert_eq!(skipped.keys, vec!["b".to_string()]);
        assert!(!skipped.is_empty());
    }
}
