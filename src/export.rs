//! LoRA export (store to kohya-style safetensors)
//!
//! Low-rank factor pairs held in the store are written back under
//! `lora_unet_*` and `lora_te*_*` keys. Fused targets are reassembled into
//! the packed tensor of their GenerativeModels key, every pair gets
//! `alpha = rank`, and embedded textual inversions are re-emitted.

use crate::config::ExportConfig;
use crate::error::{Error, Result};
use crate::importer::{EMBEDDING_PARTS, EMBEDDING_SUBMODEL};
use crate::mapping::{
    text_encoders, ArchitectureSpec, MappingOptions, ModelWeightElement, NamingFormat, SplitFormat,
    TextEncoderSlot,
};
use crate::store::{store_key, TensorStore};
use crate::tensor::{self, Tensor};
use crate::version::ModelVersion;
use ndarray::IxDyn;
use safetensors::tensor::{Dtype, TensorView};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Prefixes stripped from GenerativeModels keys before flattening.
const EXTERNAL_PREFIXES: [&str; 2] = ["model.diffusion_model.", "model."];

/// What an export wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// Up/down pairs written.
    pub pairs: usize,
    /// Embedding parts written.
    pub embeddings: usize,
    /// Targets with only some of their fused parts in the store.
    pub incomplete: usize,
    /// Hadamard and dense-diff entries left out.
    pub unsupported: usize,
}

/// Up and down factor of one exported key.
struct ExportPair {
    up: Tensor,
    down: Tensor,
}

impl ExportPair {
    fn rank(&self) -> usize {
        self.down.shape().first().copied().unwrap_or(0)
    }
}

/// Underscore stem of a GenerativeModels `.weight` key.
fn adapter_stem(key: &str) -> Option<String> {
    let module = key.strip_suffix(".weight")?;
    let module = EXTERNAL_PREFIXES
        .iter()
        .find_map(|prefix| module.strip_prefix(prefix))
        .unwrap_or(module);
    Some(module.replace('.', "_"))
}

/// Whether every tensor equals the first.
fn all_equal(tensors: &[Tensor]) -> bool {
    tensors.windows(2).all(|w| w[0] == w[1])
}

/// Rebuild the packed factor pair of `element` from its stored parts.
///
/// Parts written as shared copies collapse back to one factor; otherwise
/// the per-block factors are laid out block-diagonally.
fn reassemble(element: &ModelWeightElement, ups: Vec<Tensor>, downs: Vec<Tensor>) -> Result<ExportPair> {
    if let ([up], [down]) = (ups.as_slice(), downs.as_slice()) {
        return Ok(ExportPair {
            up: up.clone(),
            down: down.clone(),
        });
    }
    let ups: Vec<Tensor> = ups.iter().map(tensor::as_matrix).collect::<Result<_>>()?;
    let downs: Vec<Tensor> = downs.iter().map(tensor::as_matrix).collect::<Result<_>>()?;
    let (up, down) = match element.format {
        SplitFormat::O if all_equal(&downs) => (tensor::concatenate(0, &ups)?, downs[0].clone()),
        SplitFormat::O => (tensor::block_diagonal(&ups)?, tensor::concatenate(0, &downs)?),
        SplitFormat::I if all_equal(&ups) => (ups[0].clone(), tensor::concatenate(1, &downs)?),
        SplitFormat::I => (tensor::concatenate(1, &ups)?, tensor::block_diagonal(&downs)?),
    };
    if up.shape()[1] != down.shape()[0] {
        return Err(Error::Shape(format!(
            "reassembled up {:?} and down {:?} of {} disagree on rank",
            up.shape(),
            down.shape(),
            element.names.join(", ")
        )));
    }
    Ok(ExportPair { up, down })
}

/// Collects exported tensors in key order.
struct ExportWriter<'a> {
    store: &'a TensorStore,
    tensors: BTreeMap<String, Tensor>,
    summary: ExportSummary,
}

impl ExportWriter<'_> {
    /// Export every `.weight` entry of `table` stored under `submodel`.
    fn table<'t>(
        &mut self,
        entries: impl IntoIterator<Item = (&'t String, &'t ModelWeightElement)>,
        submodel: &str,
        key_prefix: &str,
    ) -> Result<()> {
        let mut seen: HashSet<&[String]> = HashSet::new();
        for (key, element) in entries {
            if !seen.insert(element.names.as_slice()) {
                continue;
            }
            let Some(stem) = adapter_stem(key) else {
                continue;
            };
            let Some(pair) = self.pair(element, submodel)? else {
                continue;
            };
            let stem = format!("{key_prefix}{stem}");
            let rank = pair.rank();
            self.tensors.insert(format!("{stem}.lora_up.weight"), pair.up);
            self.tensors.insert(format!("{stem}.lora_down.weight"), pair.down);
            self.tensors.insert(format!("{stem}.alpha"), Tensor::from_elem(IxDyn(&[]), rank as f32));
            self.summary.pairs += 1;
        }
        Ok(())
    }

    fn pair(&mut self, element: &ModelWeightElement, submodel: &str) -> Result<Option<ExportPair>> {
        let mut ups = Vec::with_capacity(element.count());
        let mut downs = Vec::with_capacity(element.count());
        for name in &element.names {
            let up = self.store.read(&store_key(submodel, name, Some("up")))?;
            let down = self.store.read(&store_key(submodel, name, Some("down")))?;
            if let (Some(up), Some(down)) = (up, down) {
                ups.push(up);
                downs.push(down);
            } else if self.store.read(&store_key(submodel, name, Some("w1_a")))?.is_some()
                || self.store.read(&store_key(submodel, name, None))?.is_some()
            {
                self.summary.unsupported += 1;
            }
        }
        if ups.is_empty() {
            return Ok(None);
        }
        if ups.len() < element.count() {
            tracing::debug!(names = ?element.names, found = ups.len(), "fused target only partly stored");
            self.summary.incomplete += 1;
            return Ok(None);
        }
        reassemble(element, ups, downs).map(Some)
    }

    fn embeddings(&mut self) -> Result<()> {
        for (source, name) in EMBEDDING_PARTS {
            if let Some(embedding) = self.store.read(&store_key(EMBEDDING_SUBMODEL, name, None))? {
                self.tensors.insert(source.to_string(), embedding);
                self.summary.embeddings += 1;
            }
        }
        Ok(())
    }
}

/// Metadata block of an exported adapter.
fn metadata(version: ModelVersion, config: &ExportConfig, path: &Path) -> HashMap<String, String> {
    let name = config.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    let mut metadata = HashMap::new();
    metadata.insert("name".to_string(), name);
    metadata.insert("version".to_string(), version.as_str().to_string());
    metadata.insert("ss_base_model_version".to_string(), version.export_tag().to_string());
    let v2 = if version == ModelVersion::V2 { "True" } else { "False" };
    metadata.insert("ss_v2".to_string(), v2.to_string());
    if let Some(trigger_word) = &config.trigger_word {
        metadata.insert("trigger_word".to_string(), trigger_word.clone());
    }
    metadata
}

/// Export the adapter held in `store` for `version` to `path`.
pub fn export_lora(
    store: &TensorStore,
    version: ModelVersion,
    options: &MappingOptions,
    config: &ExportConfig,
    path: impl AsRef<Path>,
) -> Result<ExportSummary> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), %version, "exporting LoRA");
    let network = ArchitectureSpec::for_version(version, options).network_mapping(NamingFormat::GenerativeModels);
    let (main, fixed) = version.network_prefixes();

    let mut writer = ExportWriter {
        store,
        tensors: BTreeMap::new(),
        summary: ExportSummary::default(),
    };
    if main == fixed {
        writer.table(network.main.iter().chain(network.fixed.iter()), main, "lora_unet_")?;
    } else {
        writer.table(&network.main, main, "lora_unet_")?;
        writer.table(&network.fixed, fixed, "lora_unet_")?;
    }

    let (first, second) = text_encoders(version);
    for (slot, encoder) in [(TextEncoderSlot::First, first), (TextEncoderSlot::Second, second)] {
        let Some(encoder) = encoder else {
            continue;
        };
        let key_prefix = if second.is_some() {
            slot.adapter_prefix()
        } else {
            "lora_te_"
        };
        writer.table(&encoder.mapping(), slot.store_prefix(), key_prefix)?;
    }
    writer.embeddings()?;

    let summary = writer.summary;
    if summary.unsupported > 0 {
        tracing::warn!(skipped = summary.unsupported, "Hadamard and dense-diff weights are not exported");
    }
    if summary.pairs == 0 && summary.embeddings == 0 {
        return Err(Error::TensorNotFound {
            key: format!("__{main}__[*]__up__"),
        });
    }

    let encoded: Vec<(String, Vec<u8>, Vec<usize>)> = writer
        .tensors
        .into_iter()
        .map(|(name, t)| {
            let values: Vec<f32> = t.iter().copied().collect();
            let bytes = bytemuck::cast_slice::<f32, u8>(&values).to_vec();
            (name, bytes, t.shape().to_vec())
        })
        .collect();
    let views = encoded
        .iter()
        .map(|(name, bytes, shape)| Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>>>()?;
    safetensors::serialize_to_file(views, &Some(metadata(version, config, path)), path)?;

    tracing::info!(
        pairs = summary.pairs,
        embeddings = summary.embeddings,
        incomplete = summary.incomplete,
        "LoRA exported"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{from_shape_vec, matmul};
    use approx::assert_abs_diff_eq;
    use safetensors::SafeTensors;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{i}.weight")).collect()
    }

    fn filled(shape: &[usize], seed: f32) -> Tensor {
        let n = shape.iter().product();
        from_shape_vec(shape, (0..n).map(|i| seed + i as f32 * 0.5).collect()).unwrap()
    }

    #[test]
    fn test_adapter_stem() {
        assert_eq!(
            adapter_stem("model.diffusion_model.input_blocks.4.1.proj_in.weight").as_deref(),
            Some("input_blocks_4_1_proj_in")
        );
        assert_eq!(adapter_stem("model.joint_transformer_blocks.0.attn.to_q.weight").as_deref(), Some("joint_transformer_blocks_0_attn_to_q"));
        assert_eq!(adapter_stem("double_blocks.3.img_attn.qkv.weight").as_deref(), Some("double_blocks_3_img_attn_qkv"));
        assert_eq!(adapter_stem("double_blocks.3.img_attn.qkv.bias"), None);
    }

    #[test]
    fn test_reassemble_shared_down_output_packed() {
        let element = ModelWeightElement::fused(names(3), SplitFormat::O);
        let down = filled(&[2, 4], 1.0);
        let ups: Vec<Tensor> = (0..3).map(|i| filled(&[5, 2], i as f32)).collect();
        let pair = reassemble(&element, ups.clone(), vec![down.clone(); 3]).unwrap();
        assert_eq!(pair.up.shape(), &[15, 2]);
        assert_eq!(pair.down, down);
        assert_eq!(pair.rank(), 2);
    }

    #[test]
    fn test_reassemble_block_diagonal_preserves_deltas() {
        let element = ModelWeightElement::fused(names(2), SplitFormat::O);
        let ups = vec![filled(&[3, 2], 0.0), filled(&[3, 2], 7.0)];
        let downs = vec![filled(&[2, 4], 1.0), filled(&[2, 4], -2.0)];
        let pair = reassemble(&element, ups.clone(), downs.clone()).unwrap();
        assert_eq!(pair.up.shape(), &[6, 4]);
        assert_eq!(pair.down.shape(), &[4, 4]);

        let delta = matmul(&pair.up, &pair.down).unwrap();
        for (i, (up, down)) in ups.iter().zip(&downs).enumerate() {
            let expected = matmul(up, down).unwrap();
            let block = tensor::slice_axis(&delta, 0, i * 3..(i + 1) * 3).unwrap();
            for (a, b) in block.iter().zip(expected.iter()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_reassemble_input_packed() {
        let element = ModelWeightElement::fused(names(2), SplitFormat::I);
        let up = filled(&[6, 2], 0.0);
        let downs = vec![filled(&[2, 3], 1.0), filled(&[2, 5], 2.0)];
        let pair = reassemble(&element, vec![up.clone(), up.clone()], downs).unwrap();
        assert_eq!(pair.up, up);
        assert_eq!(pair.down.shape(), &[2, 8]);

        let diagonal = reassemble(
            &element,
            vec![filled(&[6, 1], 0.0), filled(&[6, 1], 3.0)],
            vec![filled(&[1, 3], 1.0), filled(&[1, 5], 2.0)],
        )
        .unwrap();
        assert_eq!(diagonal.up.shape(), &[6, 2]);
        assert_eq!(diagonal.down.shape(), &[2, 8]);
    }

    #[test]
    fn test_metadata_defaults_to_file_stem() {
        let config = ExportConfig::default();
        let metadata = metadata(ModelVersion::V2, &config, Path::new("/tmp/my_style.safetensors"));
        assert_eq!(metadata["name"], "my_style");
        assert_eq!(metadata["ss_base_model_version"], "sd_v2");
        assert_eq!(metadata["ss_v2"], "True");
        assert!(!metadata.contains_key("trigger_word"));
    }

    #[test]
    fn test_export_writes_pairs_and_embedding() {
        let mut store = TensorStore::open_in_memory().unwrap();
        let name = "input_blocks.4.1.proj_in.weight";
        store
            .with_transaction(|tx| {
                tx.write(&store_key("unet", name, Some("up")), &filled(&[320, 4, 1, 1], 0.0))?;
                tx.write(&store_key("unet", name, Some("down")), &filled(&[4, 320, 1, 1], 1.0))?;
                tx.write(&store_key("unet", name, Some("w1_a")), &filled(&[2], 0.0))?;
                tx.write(
                    &store_key("text_model", "text_model.encoder.layers.0.self_attn.k_proj.weight", Some("up")),
                    &filled(&[768, 4], 0.0),
                )?;
                tx.write(
                    &store_key("text_model", "text_model.encoder.layers.0.self_attn.k_proj.weight", Some("down")),
                    &filled(&[4, 768], 0.0),
                )?;
                tx.write(&store_key(EMBEDDING_SUBMODEL, "string_to_param", None), &filled(&[2, 768], 0.0))
            })
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");
        let config = ExportConfig {
            name: Some("style".into()),
            trigger_word: Some("sks".into()),
        };
        let summary = export_lora(&store, ModelVersion::V1, &MappingOptions::default(), &config, &path).unwrap();
        assert_eq!(summary.pairs, 2);
        assert_eq!(summary.embeddings, 1);

        let bytes = std::fs::read(&path).unwrap();
        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        let metadata = header.metadata().as_ref().unwrap();
        assert_eq!(metadata["trigger_word"], "sks");
        assert_eq!(metadata["version"], "v1");

        let file = SafeTensors::deserialize(&bytes).unwrap();
        let up = file.tensor("lora_unet_input_blocks_4_1_proj_in.lora_up.weight").unwrap();
        assert_eq!(up.shape(), &[320, 4, 1, 1]);
        let alpha = file.tensor("lora_unet_input_blocks_4_1_proj_in.alpha").unwrap();
        assert!(alpha.shape().is_empty());
        assert_eq!(alpha.data(), 4.0f32.to_le_bytes());
        assert!(file
            .tensor("lora_te_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight")
            .is_ok());
        assert_eq!(file.tensor("emb_params").unwrap().shape(), &[2, 768]);
    }

    #[test]
    fn test_export_empty_store_fails() {
        let store = TensorStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = export_lora(
            &store,
            ModelVersion::V1,
            &MappingOptions::default(),
            &ExportConfig::default(),
            dir.path().join("out.safetensors"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::TensorNotFound { .. }));
    }
}
