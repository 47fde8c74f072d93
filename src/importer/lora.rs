//! Adapter import (low-rank, Hadamard and dense-diff)
//!
//! Up factors are processed before any down factor: the down pass needs the
//! diagonal flag recorded for the up factor of the same target, and a down
//! factor found to be block-diagonal triggers a final pass that re-splits
//! its up factor by rank columns.

use super::embedding::{multivector_length, EMBEDDING_PARTS, EMBEDDING_SUBMODEL};
use super::SkippedKeys;
use crate::archive::{open_archive, OpenedArchive, RootSelector, StateDict, TensorArchive, TensorArchiveExt};
use crate::config::ImportConfig;
use crate::decompose::Decomposer;
use crate::detect::{detect_lora, sdxl_text_encoders_swapped};
use crate::error::Result;
use crate::mapping::{
    flattened_network_keys, flattened_text_keys, text_encoders, with_flattened_aliases,
    ArchitectureSpec, MappingOptions, ModelWeightElement, ModelWeightMapping, TextEncoderConfig, TextEncoderSlot,
};
use crate::normalize::{candidate_keys, normalize_state_dict, parse_normalized, AdapterRole};
use crate::session::ImportSession;
use crate::store::{store_key, StoreTransaction, TensorStore};
use crate::tensor::{self, Tensor};
use crate::version::ModelVersion;
use std::collections::HashSet;
use std::path::Path;

/// Result of an adapter import.
#[derive(Debug, Clone, PartialEq)]
pub struct LoRAImport {
    pub version: ModelVersion,
    /// An embedded textual inversion was written.
    pub did_import_ti: bool,
    /// Multivector length of the embedded textual inversion, 0 when none.
    pub text_embedding_length: usize,
    /// At least one Hadamard factor was imported.
    pub is_loha: bool,
    pub skipped: SkippedKeys,
}

/// Sub-model a table entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Target {
    Main,
    Fixed,
    Text(TextEncoderSlot),
}

/// Flattened tables of every sub-model an adapter can touch.
struct Tables {
    version: ModelVersion,
    main: ModelWeightMapping,
    fixed: ModelWeightMapping,
    first_text: Option<ModelWeightMapping>,
    second_text: Option<ModelWeightMapping>,
    swapped: bool,
}

impl Tables {
    fn new(version: ModelVersion, options: &MappingOptions, swapped: bool) -> Self {
        let network = ArchitectureSpec::for_version(version, options).combined_mapping();
        let (first, second) = text_encoders(version);
        let text = |config: Option<TextEncoderConfig>| {
            config.map(|c| with_flattened_aliases(&c.mapping(), flattened_text_keys))
        };
        Self {
            version,
            main: with_flattened_aliases(&network.main, flattened_network_keys),
            fixed: with_flattened_aliases(&network.fixed, flattened_network_keys),
            first_text: text(first),
            second_text: text(second),
            swapped,
        }
    }

    fn prefix(&self, target: Target) -> &'static str {
        let (main, fixed) = self.version.network_prefixes();
        match target {
            Target::Main => main,
            Target::Fixed => fixed,
            Target::Text(slot) => slot.store_prefix(),
        }
    }

    fn text_slot(&self, stem: &str) -> Option<TextEncoderSlot> {
        let textual = stem.starts_with("lora_te")
            || stem.contains("text_encoder")
            || stem.contains("text_model");
        if !textual {
            return None;
        }
        let second = stem.contains("lora_te2_") || stem.contains("text_encoder_2");
        Some(if second != self.swapped {
            TextEncoderSlot::Second
        } else {
            TextEncoderSlot::First
        })
    }

    /// Table entry targeted by a normalized adapter key: main table first,
    /// then the fixed half, then the text encoder the stem names.
    fn lookup<'s>(&'s self, stem: &str, role: AdapterRole) -> Option<(Target, &'s ModelWeightElement)> {
        let candidates = candidate_keys(stem, role);
        let find = |table: &'s ModelWeightMapping| candidates.iter().find_map(move |key| table.get(key));
        if let Some(element) = find(&self.main) {
            return Some((Target::Main, element));
        }
        if let Some(element) = find(&self.fixed) {
            return Some((Target::Fixed, element));
        }
        let slot = self.text_slot(stem)?;
        let table = match slot {
            TextEncoderSlot::First => self.first_text.as_ref(),
            TextEncoderSlot::Second => self.second_text.as_ref(),
        }?;
        find(table).map(|element| (Target::Text(slot), element))
    }
}

/// Embedded textual-inversion parts an adapter for `version` may carry.
fn embedded_parts(version: ModelVersion) -> &'static [&'static str] {
    match version {
        ModelVersion::V1 | ModelVersion::V2 => &["emb_params"],
        ModelVersion::SdxlBase | ModelVersion::Ssd1b => &["clip_g", "clip_l"],
        ModelVersion::SdxlRefiner => &["clip_g"],
        ModelVersion::Sd3 | ModelVersion::Sd3Large => &["clip_g", "clip_l", "t5_xxl"],
        ModelVersion::Pixart | ModelVersion::Auraflow => &["t5_xxl"],
        ModelVersion::Flux1 => &["clip_l", "t5_xxl"],
        ModelVersion::HunyuanVideo => &["llama"],
        ModelVersion::Wan21_1_3b | ModelVersion::Wan21_14b => &["umt5_xxl"],
    }
}

/// Write the embedded textual inversion, if any.
///
/// Returns its multivector length; parts of different lengths are not
/// written and yield 0.
fn import_embedded_ti(
    archive: &dyn TensorArchive,
    state_dict: &StateDict,
    version: ModelVersion,
    tx: &mut StoreTransaction<'_>,
    session: &mut ImportSession,
) -> Result<usize> {
    let parts: Vec<_> = embedded_parts(version)
        .iter()
        .filter_map(|source| {
            let descriptor = state_dict.get(source)?;
            let name = EMBEDDING_PARTS
                .iter()
                .find(|(s, _)| s == source)
                .map(|(_, name)| *name)?;
            Some((descriptor, name))
        })
        .collect();
    let Some((first, _)) = parts.first() else {
        return Ok(0);
    };
    let length = multivector_length(first);
    let lengths: Vec<usize> = parts.iter().map(|(d, _)| multivector_length(d)).collect();
    if lengths.iter().any(|&l| l != length) {
        tracing::warn!(?lengths, "embedded textual inversion parts disagree; skipping it");
        return Ok(0);
    }
    for (descriptor, name) in &parts {
        let embedding = archive.with(descriptor, session, Ok)?;
        tx.write(&store_key(EMBEDDING_SUBMODEL, name, None), &embedding)?;
    }
    tracing::debug!(length, parts = parts.len(), "imported embedded textual inversion");
    Ok(length)
}

/// Mutable state threaded through the import passes.
struct Passes<'a> {
    archive: &'a dyn TensorArchive,
    state_dict: &'a StateDict,
    tables: &'a Tables,
    decomposer: Decomposer,
    report_skipped: bool,
    diagonal_up: HashSet<(Target, String)>,
    redefine: Vec<(String, Target, ModelWeightElement)>,
    skipped: SkippedKeys,
    is_loha: bool,
}

impl Passes<'_> {
    fn read(&self, key: &str, session: &mut ImportSession) -> Result<Tensor> {
        let descriptor = self.state_dict.require(key)?;
        self.archive.with(descriptor, session, Ok)
    }

    fn alpha(&self, stem: &str, session: &mut ImportSession) -> Result<Option<f32>> {
        let key = format!("{stem}.{}", AdapterRole::Alpha.suffix());
        match self.state_dict.get(&key) {
            Some(descriptor) => self
                .archive
                .with(descriptor, session, |t| Ok(tensor::first_value(&t))),
            None => Ok(None),
        }
    }

    fn write(
        &self,
        tx: &mut StoreTransaction<'_>,
        target: Target,
        role: AdapterRole,
        parts: Vec<(String, Tensor)>,
    ) -> Result<()> {
        let prefix = self.tables.prefix(target);
        for (name, part) in parts {
            tx.write(&store_key(prefix, &name, role.store_tag()), &part)?;
        }
        Ok(())
    }

    fn resolve(&mut self, key: &str, stem: &str, role: AdapterRole) -> Option<(Target, ModelWeightElement)> {
        let found = self
            .tables
            .lookup(stem, role)
            .map(|(target, element)| (target, element.clone()));
        if found.is_none() {
            tracing::debug!(key, "no mapping table entry for adapter key");
            self.skipped.record(key, self.report_skipped);
        }
        found
    }

    /// Up factors and the `a` factors of Hadamard pairs.
    fn first(
        &mut self,
        key: &str,
        stem: &str,
        role: AdapterRole,
        tx: &mut StoreTransaction<'_>,
        session: &mut ImportSession,
    ) -> Result<()> {
        if !matches!(role, AdapterRole::Up | AdapterRole::HadaW1A | AdapterRole::HadaW2A) {
            return Ok(());
        }
        let Some((target, element)) = self.resolve(key, stem, role) else {
            return Ok(());
        };
        let factor = self.read(key, session)?;
        let alpha = self.alpha(stem, session)?;
        if role == AdapterRole::Up {
            let up = self.decomposer.up(&element, &factor, alpha)?;
            if up.is_diagonal {
                self.diagonal_up.insert((target, element.names[0].clone()));
            }
            self.write(tx, target, role, up.parts)
        } else {
            self.is_loha = true;
            let parts = self.decomposer.hada_a(&element, &factor, alpha);
            self.write(tx, target, role, parts)
        }
    }

    /// Down, mid and dense-diff tensors and the `b` factors of Hadamard pairs.
    fn second(
        &mut self,
        key: &str,
        stem: &str,
        role: AdapterRole,
        tx: &mut StoreTransaction<'_>,
        session: &mut ImportSession,
    ) -> Result<()> {
        if matches!(
            role,
            AdapterRole::Up | AdapterRole::HadaW1A | AdapterRole::HadaW2A | AdapterRole::Alpha
        ) {
            return Ok(());
        }
        let Some((target, element)) = self.resolve(key, stem, role) else {
            return Ok(());
        };
        let tensor = self.read(key, session)?;
        let parts = match role {
            AdapterRole::Down => {
                let diagonal_up = self
                    .diagonal_up
                    .contains(&(target, element.names[0].clone()));
                let down = self.decomposer.down(&element, &tensor, diagonal_up)?;
                if down.is_diagonal {
                    self.redefine.push((stem.to_string(), target, element.clone()));
                }
                down.parts
            }
            AdapterRole::Mid => self.decomposer.mid(&element, &tensor),
            AdapterRole::HadaW1B | AdapterRole::HadaW2B => {
                self.is_loha = true;
                self.decomposer.hada_b(&element, &tensor)
            }
            _ => self.decomposer.diff(&element, &tensor)?,
        };
        self.write(tx, target, role, parts)
    }

    /// Re-split up factors of targets whose down factor is block-diagonal.
    fn redefine_ups(&mut self, tx: &mut StoreTransaction<'_>, session: &mut ImportSession) -> Result<()> {
        for (stem, target, element) in std::mem::take(&mut self.redefine) {
            let key = format!("{stem}.{}", AdapterRole::Up.suffix());
            if !self.state_dict.contains_key(&key) {
                continue;
            }
            let up = self.read(&key, session)?;
            let alpha = self.alpha(&stem, session)?;
            let parts = self.decomposer.redefined_up(&element, &up, alpha)?;
            self.write(tx, target, AdapterRole::Up, parts)?;
        }
        Ok(())
    }
}

/// Import an adapter file into `store`.
pub fn import_lora(
    path: impl AsRef<Path>,
    store: &mut TensorStore,
    config: &ImportConfig,
    session: &mut ImportSession,
) -> Result<LoRAImport> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), "importing LoRA");
    let OpenedArchive {
        archive,
        mut state_dict,
    } = open_archive(path, RootSelector::Adapter)?;
    import_lora_state_dict(archive.as_ref(), &mut state_dict, store, config, session)
}

/// Import an already opened adapter state dict into `store`.
///
/// Normalized aliases are added to `state_dict`.
pub fn import_lora_state_dict(
    archive: &dyn TensorArchive,
    state_dict: &mut StateDict,
    store: &mut TensorStore,
    config: &ImportConfig,
    session: &mut ImportSession,
) -> Result<LoRAImport> {
    normalize_state_dict(state_dict);
    let (version, options) = detect_lora(state_dict, config.force_version)?;
    let swapped = version.is_sdxl_family() && sdxl_text_encoders_swapped(state_dict);
    if swapped {
        tracing::info!("text encoder adapters are labelled the other way around");
    }
    let tables = Tables::new(version, &options, swapped);

    let state_dict: &StateDict = state_dict;
    let adapter_keys: Vec<(&str, &str, AdapterRole)> = state_dict
        .keys()
        .filter_map(|key| parse_normalized(key).map(|(stem, role)| (key, stem, role)))
        .filter(|(_, _, role)| *role != AdapterRole::Alpha)
        .collect();
    let total = adapter_keys.len();
    tracing::debug!(%version, adapter_tensors = total, "resolved adapter tables");

    let mut passes = Passes {
        archive,
        state_dict,
        tables: &tables,
        decomposer: config.decomposer(),
        report_skipped: config.report_skipped,
        diagonal_up: HashSet::new(),
        redefine: Vec::new(),
        skipped: SkippedKeys::default(),
        is_loha: false,
    };
    let text_embedding_length = store.with_transaction(|tx| {
        let length = import_embedded_ti(archive, state_dict, version, tx, session)?;
        for (i, (key, stem, role)) in adapter_keys.iter().enumerate() {
            passes.first(key, stem, *role, tx, session)?;
            session.report_count(i + 1, 2 * total);
        }
        for (i, (key, stem, role)) in adapter_keys.iter().enumerate() {
            passes.second(key, stem, *role, tx, session)?;
            session.report_count(i + total + 1, 2 * total);
        }
        passes.redefine_ups(tx, session)?;
        Ok(length)
    })?;
    session.finish();

    if !passes.skipped.is_empty() {
        tracing::warn!(skipped = passes.skipped.count, "adapter keys matched no mapping table");
    }
    tracing::info!(%version, is_loha = passes.is_loha, text_embedding_length, "LoRA imported");
    Ok(LoRAImport {
        version,
        did_import_ti: text_embedding_length > 0,
        text_embedding_length,
        is_loha: passes.is_loha,
        skipped: passes.skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{DType, DataLocation, TensorDescriptor};
    use crate::importer::tests::MemoryArchive;
    use crate::tensor::{from_shape_vec, matmul};
    use approx::assert_abs_diff_eq;
    use std::collections::HashMap;

    struct Fixture {
        archive: MemoryArchive,
        state_dict: StateDict,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                archive: MemoryArchive(HashMap::new()),
                state_dict: StateDict::new(),
            }
        }

        fn add(&mut self, key: &str, tensor: Tensor) -> &mut Self {
            self.state_dict.insert(
                key,
                TensorDescriptor {
                    key: key.into(),
                    shape: tensor.shape().to_vec(),
                    dtype: DType::F32,
                    location: DataLocation::Range { start: 0, end: 0 },
                },
            );
            self.archive.0.insert(key.into(), tensor);
            self
        }

        fn import(&mut self, store: &mut TensorStore, config: &ImportConfig) -> Result<LoRAImport> {
            import_lora_state_dict(
                &self.archive,
                &mut self.state_dict,
                store,
                config,
                &mut ImportSession::new(),
            )
        }
    }

    fn filled(shape: &[usize], f: impl Fn(usize) -> f32) -> Tensor {
        let n = shape.iter().product();
        from_shape_vec(shape, (0..n).map(f).collect()).unwrap()
    }

    const SDXL_TO_K: &str = "lora_unet_input_blocks_4_1_transformer_blocks_0_attn2_to_k";
    const SDXL_NAME: &str = "input_blocks.4.1.transformer_blocks.0.attn2.to_k.weight";

    #[test]
    fn test_embedded_ti_parts_must_agree() {
        let mut fixture = Fixture::new();
        fixture
            .add(&format!("{SDXL_TO_K}.lora_up.weight"), filled(&[2048, 8], |_| 0.0))
            .add(&format!("{SDXL_TO_K}.lora_down.weight"), filled(&[8, 2048], |_| 0.0))
            .add("clip_g", filled(&[2, 1280], |_| 1.0))
            .add("clip_l", filled(&[3, 768], |_| 1.0));
        let config = ImportConfig {
            force_version: Some(ModelVersion::SdxlBase),
            ..ImportConfig::default()
        };
        let mut store = TensorStore::open_in_memory().unwrap();
        let result = fixture.import(&mut store, &config).unwrap();
        assert!(!result.did_import_ti);
        assert_eq!(result.text_embedding_length, 0);
        assert!(store.keys("__embedding__").unwrap().is_empty());
    }

    #[test]
    fn test_embedded_ti_written_with_adapter() {
        let mut fixture = Fixture::new();
        fixture
            .add(&format!("{SDXL_TO_K}.lora_up.weight"), filled(&[2048, 8], |_| 0.0))
            .add(&format!("{SDXL_TO_K}.lora_down.weight"), filled(&[8, 2048], |_| 0.0))
            .add("clip_g", filled(&[2, 1280], |_| 1.0))
            .add("clip_l", filled(&[2, 768], |_| 1.0));
        let config = ImportConfig {
            force_version: Some(ModelVersion::SdxlBase),
            ..ImportConfig::default()
        };
        let mut store = TensorStore::open_in_memory().unwrap();
        let result = fixture.import(&mut store, &config).unwrap();
        assert!(result.did_import_ti);
        assert_eq!(result.text_embedding_length, 2);
        assert_eq!(store.keys("__embedding__").unwrap().len(), 2);
    }

    #[test]
    fn test_unmapped_keys_are_reported() {
        let mut fixture = Fixture::new();
        fixture
            .add(&format!("{SDXL_TO_K}.lora_up.weight"), filled(&[2048, 4], |_| 0.1))
            .add(&format!("{SDXL_TO_K}.lora_down.weight"), filled(&[4, 2048], |_| 0.1))
            .add("lora_unet_made_up_module.lora_up.weight", filled(&[2, 1], |_| 1.0))
            .add("lora_unet_made_up_module.lora_down.weight", filled(&[1, 2], |_| 1.0));
        let config = ImportConfig {
            force_version: Some(ModelVersion::SdxlBase),
            report_skipped: true,
            ..ImportConfig::default()
        };
        let mut store = TensorStore::open_in_memory().unwrap();
        let result = fixture.import(&mut store, &config).unwrap();
        assert_eq!(result.skipped.count, 2);
        assert_eq!(
            result.skipped.keys,
            vec![
                "lora_unet_made_up_module.lora_up.weight".to_string(),
                "lora_unet_made_up_module.lora_down.weight".to_string(),
            ]
        );
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_text_encoder_adapter_lands_in_text_model() {
        let mut fixture = Fixture::new();
        let stem = "lora_te1_text_model_encoder_layers_0_self_attn_k_proj";
        fixture
            .add(&format!("{stem}.lora_up.weight"), filled(&[768, 4], |_| 0.5))
            .add(&format!("{stem}.lora_down.weight"), filled(&[4, 768], |_| 0.5))
            .add(
                "lora_te2_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight",
                filled(&[4, 1280], |_| 0.5),
            )
            .add(
                "lora_te2_text_model_encoder_layers_0_self_attn_k_proj.lora_up.weight",
                filled(&[1280, 4], |_| 0.5),
            );
        let mut store = TensorStore::open_in_memory().unwrap();
        let result = fixture.import(&mut store, &ImportConfig::default()).unwrap();
        assert_eq!(result.version, ModelVersion::SdxlBase);
        let name = "text_model.encoder.layers.0.self_attn.k_proj.weight";
        assert!(store.read(&store_key("text_model", name, Some("up"))).unwrap().is_some());
        assert!(store
            .read(&store_key("te2__text_model", name, Some("down")))
            .unwrap()
            .is_some());
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn test_fused_qkv_single_block_is_split() {
        // Flux double-block qkv packs q, k and v on the output axis.
        let hidden = crate::mapping::FluxConfig::dev().hidden_size;
        let rank = 2;
        let stem = "lora_unet_double_blocks_0_img_attn_qkv";
        let up = filled(&[3 * hidden, 3 * rank], |k| {
            let (row, col) = (k / (3 * rank), k % (3 * rank));
            if row / hidden == col / rank {
                0.25
            } else {
                0.0
            }
        });
        let down = filled(&[3 * rank, hidden], |k| (k % 7) as f32 * 0.1);
        let mut fixture = Fixture::new();
        fixture
            .add(&format!("{stem}.lora_up.weight"), up)
            .add(&format!("{stem}.lora_down.weight"), down)
            .add(&format!("{stem}.alpha"), tensor::scalar((3 * rank) as f32))
            .add(
                "lora_unet_double_blocks_18_img_attn_qkv.lora_down.weight",
                filled(&[1, hidden], |_| 0.0),
            );
        let mut store = TensorStore::open_in_memory().unwrap();
        let result = fixture.import(&mut store, &ImportConfig::default()).unwrap();
        assert_eq!(result.version, ModelVersion::Flux1);

        let k_up = store
            .read(&store_key("dit", "double_blocks.0.img_attn.k.weight", Some("up")))
            .unwrap()
            .unwrap();
        let k_down = store
            .read(&store_key("dit", "double_blocks.0.img_attn.k.weight", Some("down")))
            .unwrap()
            .unwrap();
        assert_eq!(k_up.shape(), &[hidden, rank]);
        assert_eq!(k_down.shape(), &[rank, hidden]);
        let delta = matmul(&k_up, &k_down).unwrap();
        for col in [0, 1, hidden - 1] {
            let expected: f32 = (rank..2 * rank)
                .map(|row| 0.25 * ((row * hidden + col) % 7) as f32 * 0.1)
                .sum();
            assert_abs_diff_eq!(delta[[0, col]], expected, epsilon = 1e-5);
        }
    }
}
