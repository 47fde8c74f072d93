//! ESRGAN upscaler import

use super::{present_count, write_table};
use crate::archive::{open_archive, OpenedArchive, RootSelector, StateDict, TensorArchive};
use crate::error::{Error, Result};
use crate::mapping::{canonical_names, rrdb_mapping, RRDBConfig};
use crate::session::ImportSession;
use crate::store::TensorStore;
use std::path::Path;

/// Store submodel of upscalers.
pub const UPSCALER_SUBMODEL: &str = "upscaler";

/// Upper bound on counted block and upsample counts.
const MAX_BLOCKS: usize = 64;
const MAX_UPSAMPLE_CONVS: usize = 4;

/// Result of an upscaler import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpscalerImport {
    /// RRDB blocks in the trunk.
    pub blocks: usize,
    /// Upscale factor, two to the number of upsample convolutions.
    pub scale_factor: usize,
}

/// Layout and spelling of an RRDB checkpoint.
fn inspect_rrdb(state_dict: &StateDict) -> Result<(RRDBConfig, bool)> {
    let legacy = state_dict.contains_key("model.0.weight");
    let block_key = |n: usize| {
        if legacy {
            format!("model.1.sub.{n}.RDB1.conv1.0.weight")
        } else {
            format!("body.{n}.rdb1.conv1.weight")
        }
    };
    let blocks = (0..MAX_BLOCKS)
        .take_while(|&n| state_dict.contains_key(&block_key(n)))
        .count();
    if blocks == 0 {
        return Err(Error::tensor_not_found(block_key(0)));
    }
    let upsample_convs = if legacy {
        (1..=MAX_UPSAMPLE_CONVS)
            .rev()
            .find(|u| state_dict.contains_key(&format!("model.{}.weight", 3 * u + 4)))
            .unwrap_or(0)
    } else {
        (1..=MAX_UPSAMPLE_CONVS)
            .take_while(|i| state_dict.contains_key(&format!("conv_up{i}.weight")))
            .count()
    };
    Ok((
        RRDBConfig {
            blocks,
            upsample_convs,
        },
        legacy,
    ))
}

/// Import an ESRGAN checkpoint into `store`.
pub fn import_upscaler(
    path: impl AsRef<Path>,
    store: &mut TensorStore,
    session: &mut ImportSession,
) -> Result<UpscalerImport> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), "importing upscaler");
    let OpenedArchive {
        archive,
        state_dict,
    } = open_archive(path, RootSelector::Upscaler)?;
    import_upscaler_state_dict(archive.as_ref(), &state_dict, store, session)
}

pub(crate) fn import_upscaler_state_dict(
    archive: &dyn TensorArchive,
    state_dict: &StateDict,
    store: &mut TensorStore,
    session: &mut ImportSession,
) -> Result<UpscalerImport> {
    let (config, legacy) = inspect_rrdb(state_dict)?;
    let mapping = rrdb_mapping(&config, legacy);
    let expected = canonical_names(&mapping).len();
    session.expect_accesses(present_count(&mapping, state_dict));

    let prefix = format!("__{UPSCALER_SUBMODEL}__[");
    store.with_transaction(|tx| {
        tx.remove_prefix(&prefix)?;
        write_table(archive, state_dict, &mapping, UPSCALER_SUBMODEL, tx, session)?;
        let actual = tx.keys(&prefix)?.len();
        if actual != expected {
            return Err(Error::TensorWritesFailed { expected, actual });
        }
        Ok(())
    })?;
    session.finish();

    tracing::info!(
        blocks = config.blocks,
        scale = config.scale_factor(),
        legacy,
        "upscaler imported"
    );
    Ok(UpscalerImport {
        blocks: config.blocks,
        scale_factor: config.scale_factor(),
    })
}
