//! Textual-inversion embedding import

use crate::archive::{
    open_archive, OpenedArchive, RootSelector, StateDict, TensorArchive, TensorArchiveExt,
    TensorDescriptor,
};
use crate::config::ImportConfig;
use crate::error::{Error, Result};
use crate::session::ImportSession;
use crate::store::{store_key, TensorStore};
use crate::version::ModelVersion;
use std::path::Path;

/// Store submodel of embeddings.
pub const EMBEDDING_SUBMODEL: &str = "embedding";

/// Source tensor name and store name of each embedding part.
pub const EMBEDDING_PARTS: &[(&str, &str)] = &[
    ("emb_params", "string_to_param"),
    ("clip_g", "string_to_param_clip_g"),
    ("clip_l", "string_to_param_clip_l"),
    ("t5_xxl", "string_to_param_t5_xxl"),
    ("llama", "string_to_param_llama"),
    ("umt5_xxl", "string_to_param_umt5_xxl"),
];

/// Longest sequence a CLIP text encoder accepts.
const MAX_TOKENS: usize = 77;

/// Token width of the OpenCLIP ViT-bigG encoder.
const CLIP_G_WIDTH: usize = 1280;
/// Token width of the CLIP ViT-L encoder.
const CLIP_L_WIDTH: usize = 768;

/// Result of an embedding import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingImport {
    pub version: ModelVersion,
    /// Number of token vectors.
    pub length: usize,
}

/// Leading dimension of an embedding, 1 for a single vector.
pub(crate) fn multivector_length(descriptor: &TensorDescriptor) -> usize {
    if descriptor.shape.len() >= 2 {
        descriptor.shape[0]
    } else {
        1
    }
}

fn version_for_width(width: usize) -> Option<ModelVersion> {
    match width {
        768 => Some(ModelVersion::V1),
        1024 => Some(ModelVersion::V2),
        _ => None,
    }
}

/// Tensor of a single-encoder embedding: `*`, `emb_params`, or any 1-2-D
/// tensor of a known width with fewer than 77 rows.
fn single_part(state_dict: &StateDict) -> Option<(&TensorDescriptor, ModelVersion)> {
    let known = ["*", "emb_params"]
        .iter()
        .find_map(|key| state_dict.get(key))
        .and_then(|d| Some((d, version_for_width(d.last_dim()?)?)));
    known.or_else(|| {
        state_dict.iter().find_map(|(_, d)| {
            let plausible = (1..=2).contains(&d.shape.len()) && multivector_length(d) < MAX_TOKENS;
            plausible
                .then(|| version_for_width(d.last_dim()?))
                .flatten()
                .map(|version| (d, version))
        })
    })
}

/// Import a textual-inversion file into `store`.
pub fn import_embedding(
    path: impl AsRef<Path>,
    store: &mut TensorStore,
    config: &ImportConfig,
    session: &mut ImportSession,
) -> Result<EmbeddingImport> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), "importing embedding");
    let OpenedArchive {
        archive,
        state_dict,
    } = open_archive(path, RootSelector::Embedding)?;
    import_embedding_state_dict(archive.as_ref(), &state_dict, store, config, session)
}

pub(crate) fn import_embedding_state_dict(
    archive: &dyn TensorArchive,
    state_dict: &StateDict,
    store: &mut TensorStore,
    config: &ImportConfig,
    session: &mut ImportSession,
) -> Result<EmbeddingImport> {
    let (parts, version): (Vec<(&TensorDescriptor, &str)>, ModelVersion) =
        match (state_dict.get("clip_g"), state_dict.get("clip_l")) {
            (Some(g), Some(l)) => {
                if g.last_dim() != Some(CLIP_G_WIDTH) {
                    return Err(Error::tensor_not_found("clip_g"));
                }
                if l.last_dim() != Some(CLIP_L_WIDTH) {
                    return Err(Error::tensor_not_found("clip_l"));
                }
                let lengths = vec![multivector_length(g), multivector_length(l)];
                if lengths[0] != lengths[1] {
                    return Err(Error::EmbeddingMismatch { lengths });
                }
                let version = match config.force_version {
                    Some(v) if v.is_sdxl_family() => v,
                    _ => ModelVersion::SdxlBase,
                };
                (
                    vec![(g, "string_to_param_clip_g"), (l, "string_to_param_clip_l")],
                    version,
                )
            }
            _ => {
                let (descriptor, version) = single_part(state_dict)
                    .ok_or_else(|| Error::tensor_not_found("emb_params"))?;
                (vec![(descriptor, "string_to_param")], version)
            }
        };
    let length = multivector_length(parts[0].0);

    session.expect_accesses(parts.len());
    store.with_transaction(|tx| {
        tx.remove_prefix(&format!("__{EMBEDDING_SUBMODEL}__["))?;
        for (descriptor, name) in &parts {
            let embedding = archive.with(descriptor, session, Ok)?;
            tx.write(&store_key(EMBEDDING_SUBMODEL, name, None), &embedding)?;
        }
        Ok(())
    })?;
    session.finish();
    tracing::info!(%version, length, "embedding imported");
    Ok(EmbeddingImport { version, length })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{DType, DataLocation};
    use crate::importer::tests::MemoryArchive;
    use crate::tensor::from_shape_vec;
    use std::collections::HashMap;

    fn fixture(parts: &[(&str, Vec<usize>)]) -> (MemoryArchive, StateDict) {
        let mut state_dict = StateDict::new();
        let mut tensors = HashMap::new();
        for (key, shape) in parts {
            state_dict.insert(
                *key,
                TensorDescriptor {
                    key: key.to_string(),
                    shape: shape.clone(),
                    dtype: DType::F32,
                    location: DataLocation::Range { start: 0, end: 0 },
                },
            );
            let n = shape.iter().product();
            tensors.insert(key.to_string(), from_shape_vec(shape, vec![0.1; n]).unwrap());
        }
        (MemoryArchive(tensors), state_dict)
    }

    fn import(parts: &[(&str, Vec<usize>)], store: &mut TensorStore) -> Result<EmbeddingImport> {
        let (archive, state_dict) = fixture(parts);
        import_embedding_state_dict(
            &archive,
            &state_dict,
            store,
            &ImportConfig::default(),
            &mut ImportSession::new(),
        )
    }

    #[test]
    fn test_single_encoder_versions() {
        let mut store = TensorStore::open_in_memory().unwrap();
        let v1 = import(&[("*", vec![4, 768])], &mut store).unwrap();
        assert_eq!(v1, EmbeddingImport { version: ModelVersion::V1, length: 4 });
        let v2 = import(&[("emb_params", vec![1024])], &mut store).unwrap();
        assert_eq!(v2, EmbeddingImport { version: ModelVersion::V2, length: 1 });
        assert_eq!(store.keys("__embedding__").unwrap().len(), 1);
    }

    #[test]
    fn test_fallback_to_plausible_tensor() {
        let mut store = TensorStore::open_in_memory().unwrap();
        let found = import(&[("learned", vec![3, 768])], &mut store).unwrap();
        assert_eq!(found.length, 3);
        let err = import(&[("learned", vec![100, 768])], &mut store).unwrap_err();
        assert!(matches!(err, Error::TensorNotFound { .. }));
    }

    #[test]
    fn test_sdxl_pair() {
        let mut store = TensorStore::open_in_memory().unwrap();
        let result = import(&[("clip_g", vec![2, 1280]), ("clip_l", vec![2, 768])], &mut store).unwrap();
        assert_eq!(result.version, ModelVersion::SdxlBase);
        assert_eq!(result.length, 2);
        assert!(store
            .read("__embedding__[string_to_param_clip_g]")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_sdxl_pair_rejects_wrong_widths() {
        let mut store = TensorStore::open_in_memory().unwrap();
        let swapped = import(&[("clip_g", vec![2, 768]), ("clip_l", vec![2, 1280])], &mut store);
        assert!(matches!(swapped, Err(Error::TensorNotFound { ref key }) if key == "clip_g"));
        let narrow_l = import(&[("clip_g", vec![2, 1280]), ("clip_l", vec![2, 1024])], &mut store);
        assert!(matches!(narrow_l, Err(Error::TensorNotFound { ref key }) if key == "clip_l"));
        assert!(store.is_empty().unwrap());
    }
}
