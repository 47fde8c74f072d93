//! ControlNet import

use super::{present_count, write_table};
use crate::archive::{open_archive, OpenedArchive, RootSelector, StateDict, TensorArchive};
use crate::detect::{detect_controlnet, ControlNetKind, ControlNetLayout};
use crate::error::Result;
use crate::mapping::{controlnet_mapping, flux_controlnet_mapping, ControlNetMapping, UNetConfig};
use crate::session::ImportSession;
use crate::store::TensorStore;
use crate::version::ModelVersion;
use std::path::Path;

const CONTROL_MODEL_PREFIX: &str = "model.control_model.";

/// Store submodels of a ControlNet.
pub const CONTROLNET_SUBMODELS: [&str; 3] = ["controlnet", "controlnet_fixed", "hintnet"];

/// Result of a ControlNet import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlNetImport {
    pub version: ModelVersion,
    pub kind: ControlNetKind,
}

/// Alias `control_model.X` and bare GenerativeModels keys under the
/// `model.control_model.` prefix the tables use.
fn alias_control_prefix(state_dict: &mut StateDict) -> usize {
    let mut added = 0;
    for key in state_dict.key_snapshot() {
        if key.starts_with(CONTROL_MODEL_PREFIX) {
            continue;
        }
        let rest = key.strip_prefix("control_model.").unwrap_or(&key);
        if state_dict.alias(format!("{CONTROL_MODEL_PREFIX}{rest}"), &key) {
            added += 1;
        }
    }
    added
}

/// UNet encoder of `version` with the transformer depths a ControlNet
/// reports in place of the base model's.
fn unet_config(
    version: ModelVersion,
    level1_depth: Option<usize>,
    level2_depth: Option<usize>,
    middle_depth: Option<usize>,
) -> UNetConfig {
    let mut config = match version {
        ModelVersion::V2 => UNetConfig::v2(),
        ModelVersion::SdxlBase => UNetConfig::sdxl_base(),
        _ => UNetConfig::v1(),
    };
    for (level, depth) in [(1, level1_depth), (2, level2_depth)] {
        if let (Some(depth), Some(blocks)) = (depth, config.input_attention.get_mut(level)) {
            blocks.iter_mut().for_each(|d| *d = depth);
        }
    }
    if let Some(depth) = middle_depth {
        config.middle_attention = depth;
    }
    config
}

/// Import a ControlNet file into `store`.
pub fn import_controlnet(
    path: impl AsRef<Path>,
    store: &mut TensorStore,
    session: &mut ImportSession,
) -> Result<ControlNetImport> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), "importing ControlNet");
    let OpenedArchive {
        archive,
        mut state_dict,
    } = open_archive(path, RootSelector::Adapter)?;
    import_controlnet_state_dict(archive.as_ref(), &mut state_dict, store, session)
}

pub(crate) fn import_controlnet_state_dict(
    archive: &dyn TensorArchive,
    state_dict: &mut StateDict,
    store: &mut TensorStore,
    session: &mut ImportSession,
) -> Result<ControlNetImport> {
    alias_control_prefix(state_dict);
    let inspection = detect_controlnet(state_dict)?;
    let union = inspection.kind == ControlNetKind::ControlNetUnion;
    let mapping: ControlNetMapping = match inspection.layout {
        ControlNetLayout::UNet {
            level1_depth,
            level2_depth,
            middle_depth,
        } => {
            let unet = unet_config(inspection.version, level1_depth, level2_depth, middle_depth);
            controlnet_mapping(&unet, inspection.naming, union)
        }
        ControlNetLayout::Flux { double, single } => flux_controlnet_mapping(double, single, union),
    };

    let state_dict: &StateDict = state_dict;
    let tables = [&mapping.main, &mapping.fixed, &mapping.hint];
    session.expect_accesses(tables.iter().map(|t| present_count(t, state_dict)).sum());
    let written = store.with_transaction(|tx| {
        let mut written = 0;
        for (table, submodel) in tables.into_iter().zip(CONTROLNET_SUBMODELS) {
            tx.remove_prefix(&format!("__{submodel}__["))?;
            written += write_table(archive, state_dict, table, submodel, tx, session)?;
        }
        Ok(written)
    })?;
    session.finish();

    tracing::info!(
        version = %inspection.version,
        kind = ?inspection.kind,
        naming = ?inspection.naming,
        tensors = written,
        "ControlNet imported"
    );
    Ok(ControlNetImport {
        version: inspection.version,
        kind: inspection.kind,
    })
}
