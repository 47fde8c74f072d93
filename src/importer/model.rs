//! Full checkpoint import

use super::{present_count, write_table};
use crate::archive::{open_archive, OpenedArchive, RootSelector, StateDict, TensorArchive, TensorArchiveExt};
use crate::config::ImportConfig;
use crate::detect::{detect_model, ModelInspection};
use crate::error::{Error, Result};
use crate::mapping::{
    checkpoint_text_encoders, ArchitectureSpec, AutoencoderConfig, ModelWeightMapping, NamingFormat,
    PROJECTION,
};
use crate::session::ImportSession;
use crate::store::{store_key, StoreTransaction, TensorStore};
use crate::tensor;
use crate::version::{ModelVersion, SamplerModifier};
use std::path::Path;

const DIFFUSION_MODEL_PREFIX: &str = "model.diffusion_model.";

/// Result of a full-model import.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelImport {
    pub version: ModelVersion,
    pub modifier: SamplerModifier,
    pub is_diffusers: bool,
    pub inspection: ModelInspection,
    /// Store submodels written, denoising network first.
    pub submodels: Vec<String>,
}

/// A submodel bundled next to the denoising network: a text encoder or one
/// half of the autoencoder.
#[derive(Debug)]
struct Component {
    submodel: &'static str,
    table: ModelWeightMapping,
    /// Checkpoint key of a projection stored as [`PROJECTION`], and whether
    /// it is transposed on the way in.
    projection: Option<(String, bool)>,
    expected: usize,
}

impl Component {
    fn is_present(&self, state_dict: &StateDict) -> bool {
        self.table.keys().any(|key| state_dict.contains_key(key))
    }

    fn accesses(&self, state_dict: &StateDict) -> usize {
        let projection = self
            .projection
            .as_ref()
            .is_some_and(|(key, _)| state_dict.contains_key(key));
        present_count(&self.table, state_dict) + usize::from(projection)
    }

    fn write(
        &self,
        archive: &dyn TensorArchive,
        state_dict: &StateDict,
        tx: &mut StoreTransaction<'_>,
        session: &mut ImportSession,
    ) -> Result<()> {
        let prefix = format!("__{}__[", self.submodel);
        tx.remove_prefix(&prefix)?;
        write_table(archive, state_dict, &self.table, self.submodel, tx, session)?;
        if let Some((key, transposed)) = &self.projection {
            if let Some(descriptor) = state_dict.get(key) {
                let projection = archive.with(descriptor, session, Ok)?;
                let projection = if *transposed {
                    tensor::transposed(&projection)
                } else {
                    projection
                };
                tx.write(&store_key(self.submodel, PROJECTION, None), &projection)?;
            }
        }
        let actual = tx.keys(&prefix)?.len();
        if actual != self.expected {
            return Err(Error::TensorWritesFailed {
                expected: self.expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Text encoders and autoencoder halves the checkpoint carries.
fn bundled_components(version: ModelVersion, naming: NamingFormat, state_dict: &StateDict) -> Vec<Component> {
    let mut components: Vec<Component> = checkpoint_text_encoders(version)
        .into_iter()
        .map(|encoder| Component {
            submodel: encoder.slot.store_prefix(),
            table: encoder.mapping(),
            projection: encoder
                .projection_key()
                .map(|key| (key, encoder.projection_transposed())),
            expected: encoder.config.expected_tensors(),
        })
        .collect();
    if let Some(vae) = AutoencoderConfig::for_version(version) {
        components.push(Component {
            submodel: "encoder",
            table: vae.encoder_mapping(naming),
            projection: None,
            expected: vae.encoder_tensors(),
        });
        components.push(Component {
            submodel: "decoder",
            table: vae.decoder_mapping(naming),
            projection: None,
            expected: vae.decoder_tensors(),
        });
    }
    components.retain(|component| component.is_present(state_dict));
    components
}

/// Transformer checkpoints saved from a UNet-era trainer keep the
/// `model.diffusion_model.` prefix; alias those keys without it.
fn alias_prefixless(state_dict: &mut StateDict) -> usize {
    let mut added = 0;
    for key in state_dict.key_snapshot() {
        if let Some(stripped) = key.strip_prefix(DIFFUSION_MODEL_PREFIX) {
            if state_dict.alias(stripped, &key) {
                added += 1;
            }
        }
    }
    added
}

/// Import a full checkpoint into `store`: the denoising network plus any
/// text encoders and autoencoder it bundles.
///
/// Tensors previously stored under the written submodels are replaced.
pub fn import_model(
    path: impl AsRef<Path>,
    store: &mut TensorStore,
    config: &ImportConfig,
    session: &mut ImportSession,
) -> Result<ModelImport> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), "importing model");
    let OpenedArchive {
        archive,
        mut state_dict,
    } = open_archive(path, RootSelector::FullModel)?;
    import_model_state_dict(archive.as_ref(), &mut state_dict, store, config, session)
}

pub(crate) fn import_model_state_dict(
    archive: &dyn TensorArchive,
    state_dict: &mut StateDict,
    store: &mut TensorStore,
    config: &ImportConfig,
    session: &mut ImportSession,
) -> Result<ModelImport> {
    let inspection = detect_model(state_dict, config.force_version)?;
    let version = inspection.version;
    if !version.is_unet_family() {
        let added = alias_prefixless(state_dict);
        tracing::debug!(added, "aliased prefixed transformer keys");
    }

    let spec = ArchitectureSpec::for_version(version, &inspection.options);
    let mapping = spec.network_mapping(inspection.naming);
    let hid_proj: Vec<&str> = if inspection.has_encoder_hid_proj {
        ["encoder_hid_proj.weight", "encoder_hid_proj.bias"]
            .into_iter()
            .filter(|key| state_dict.contains_key(key))
            .collect()
    } else {
        Vec::new()
    };
    let expected = spec.expected_tensors() + hid_proj.len();
    let components = bundled_components(version, inspection.naming, state_dict);
    session.expect_accesses(
        present_count(&mapping.main, state_dict)
            + present_count(&mapping.fixed, state_dict)
            + hid_proj.len()
            + components.iter().map(|c| c.accesses(state_dict)).sum::<usize>(),
    );

    let (main, fixed) = version.network_prefixes();
    let main_prefix = format!("__{main}__[");
    let fixed_prefix = format!("__{fixed}__[");
    let state_dict: &StateDict = state_dict;
    store.with_transaction(|tx| {
        tx.remove_prefix(&main_prefix)?;
        if fixed_prefix != main_prefix {
            tx.remove_prefix(&fixed_prefix)?;
        }
        write_table(archive, state_dict, &mapping.main, main, tx, session)?;
        write_table(archive, state_dict, &mapping.fixed, fixed, tx, session)?;
        for key in &hid_proj {
            let descriptor = state_dict.require(key)?;
            let tensor = archive.with(descriptor, session, Ok)?;
            tx.write(&store_key(main, key, None), &tensor)?;
        }

        let mut actual = tx.keys(&main_prefix)?.len();
        if fixed_prefix != main_prefix {
            actual += tx.keys(&fixed_prefix)?.len();
        }
        if actual != expected {
            return Err(Error::TensorWritesFailed { expected, actual });
        }
        for component in &components {
            component.write(archive, state_dict, tx, session)?;
        }
        Ok(())
    })?;
    session.finish();

    let mut submodels = vec![main.to_string()];
    if fixed != main && !mapping.fixed.is_empty() {
        submodels.push(fixed.to_string());
    }
    submodels.extend(components.iter().map(|c| c.submodel.to_string()));
    tracing::info!(
        %version,
        modifier = ?inspection.modifier,
        naming = ?inspection.naming,
        tensors = expected,
        ?submodels,
        "model imported"
    );
    Ok(ModelImport {
        version,
        modifier: inspection.modifier,
        is_diffusers: inspection.naming == NamingFormat::Diffusers,
        inspection,
        submodels,
    })
}
