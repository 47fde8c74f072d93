//! CLI command implementations

use super::logging::log;
use super::{resolve_config, Cli, Command, ExportArgs, ImportArgs, InspectArgs, InspectKind, LogLevel};
use crate::archive::{open_archive, RootSelector, StateDict};
use crate::config::{ExportConfig, ImportConfig};
use crate::detect::{detect_lora, detect_model};
use crate::error::Result;
use crate::export::export_lora;
use crate::importer::{
    import_controlnet, import_embedding, import_lora, import_model, import_upscaler,
};
use crate::mapping::MappingOptions;
use crate::normalize::{normalize_state_dict, parse_normalized, AdapterRole};
use crate::session::ImportSession;
use crate::store::TensorStore;
use crate::version::ModelVersion;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Execute a CLI command based on the parsed arguments
pub fn run_command(cli: Cli) -> Result<()> {
    let level = cli.log_level();

    match &cli.command {
        Command::Inspect(args) => run_inspect(args, level),
        Command::ImportModel(args) => {
            let config = resolve_config(&cli, &args.overrides)?;
            run_import_model(args, &config, level)
        }
        Command::ImportLora(args) => {
            let config = resolve_config(&cli, &args.overrides)?;
            run_import_lora(args, &config, level)
        }
        Command::ImportControlnet(args) => {
            let config = resolve_config(&cli, &args.overrides)?;
            let mut store = open_store(&args.store, &config)?;
            let result = import_controlnet(&args.input, &mut store, &mut session())?;
            log(
                level,
                LogLevel::Normal,
                &format!("Imported {:?} for {}", result.kind, result.version),
            );
            Ok(())
        }
        Command::ImportEmbedding(args) => {
            let config = resolve_config(&cli, &args.overrides)?;
            let mut store = open_store(&args.store, &config)?;
            let result = import_embedding(&args.input, &mut store, &config, &mut session())?;
            log(
                level,
                LogLevel::Normal,
                &format!("Imported {}-vector embedding for {}", result.length, result.version),
            );
            Ok(())
        }
        Command::ImportUpscaler(args) => {
            let config = resolve_config(&cli, &args.overrides)?;
            let mut store = open_store(&args.store, &config)?;
            let result = import_upscaler(&args.input, &mut store, &mut session())?;
            log(
                level,
                LogLevel::Normal,
                &format!("Imported x{} upscaler with {} blocks", result.scale_factor, result.blocks),
            );
            Ok(())
        }
        Command::ExportLora(args) => {
            let config = match &cli.config {
                Some(path) => ImportConfig::load(path)?,
                None => ImportConfig::default(),
            };
            run_export_lora(args, config.export, level)
        }
    }
}

fn open_store(path: &Path, config: &ImportConfig) -> Result<TensorStore> {
    Ok(TensorStore::open(path)?.with_precision(config.precision))
}

/// Session reporting progress at trace level.
fn session() -> ImportSession {
    ImportSession::new().with_progress(|fraction| tracing::trace!(progress = fraction, "import progress"))
}

fn run_import_model(args: &ImportArgs, config: &ImportConfig, level: LogLevel) -> Result<()> {
    let mut store = open_store(&args.store, config)?;
    let result = import_model(&args.input, &mut store, config, &mut session())?;
    log(
        level,
        LogLevel::Normal,
        &format!("Imported {} model ({:?})", result.version, result.modifier),
    );
    if result.is_diffusers {
        log(level, LogLevel::Verbose, "  Naming: diffusers");
    }
    log(
        level,
        LogLevel::Verbose,
        &format!("  Submodels: {}", result.submodels.join(", ")),
    );
    Ok(())
}

fn run_import_lora(args: &ImportArgs, config: &ImportConfig, level: LogLevel) -> Result<()> {
    let mut store = open_store(&args.store, config)?;
    let result = import_lora(&args.input, &mut store, config, &mut session())?;
    let kind = if result.is_loha { "LoHa" } else { "LoRA" };
    log(level, LogLevel::Normal, &format!("Imported {kind} for {}", result.version));
    if result.did_import_ti {
        log(
            level,
            LogLevel::Normal,
            &format!("  Embedded textual inversion: {} vectors", result.text_embedding_length),
        );
    }
    if !result.skipped.is_empty() {
        log(
            level,
            LogLevel::Normal,
            &format!("  Skipped keys: {}", result.skipped.count),
        );
        for key in &result.skipped.keys {
            log(level, LogLevel::Normal, &format!("    {key}"));
        }
    }
    Ok(())
}

fn run_export_lora(args: &ExportArgs, mut export: ExportConfig, level: LogLevel) -> Result<()> {
    if args.name.is_some() {
        export.name = args.name.clone();
    }
    if args.trigger_word.is_some() {
        export.trigger_word = args.trigger_word.clone();
    }
    let store = TensorStore::open(&args.store)?;
    let summary = export_lora(&store, args.version, &MappingOptions::default(), &export, &args.output)?;
    log(
        level,
        LogLevel::Normal,
        &format!(
            "Exported {} pairs and {} embedding parts to {}",
            summary.pairs,
            summary.embeddings,
            args.output.display()
        ),
    );
    if summary.incomplete > 0 || summary.unsupported > 0 {
        log(
            level,
            LogLevel::Verbose,
            &format!(
                "  Left out: {} partly stored fused targets, {} Hadamard or diff weights",
                summary.incomplete, summary.unsupported
            ),
        );
    }
    Ok(())
}

/// What `inspect` found in a checkpoint.
#[derive(Debug, Serialize)]
struct InspectReport {
    tensors: usize,
    parameters: u64,
    dtypes: BTreeMap<String, usize>,
    version: Option<ModelVersion>,
    naming: Option<String>,
    modifier: Option<String>,
    adapter_tensors: Option<usize>,
    detection_error: Option<String>,
}

impl InspectReport {
    fn new(state_dict: &StateDict) -> Self {
        let mut dtypes = BTreeMap::new();
        let mut parameters = 0u64;
        for (_, descriptor) in state_dict.iter() {
            *dtypes.entry(format!("{:?}", descriptor.dtype)).or_insert(0) += 1;
            parameters += descriptor.numel() as u64;
        }
        Self {
            tensors: state_dict.len(),
            parameters,
            dtypes,
            version: None,
            naming: None,
            modifier: None,
            adapter_tensors: None,
            detection_error: None,
        }
    }
}

fn run_inspect(args: &InspectArgs, level: LogLevel) -> Result<()> {
    let root = match args.kind {
        InspectKind::Model => RootSelector::FullModel,
        InspectKind::Lora => RootSelector::Adapter,
    };
    let mut state_dict = open_archive(&args.input, root)?.state_dict;
    let mut report = InspectReport::new(&state_dict);
    match args.kind {
        InspectKind::Model => match detect_model(&state_dict, args.force_version) {
            Ok(inspection) => {
                report.version = Some(inspection.version);
                report.naming = Some(format!("{:?}", inspection.naming));
                report.modifier = Some(format!("{:?}", inspection.modifier));
            }
            Err(err) => report.detection_error = Some(err.to_string()),
        },
        InspectKind::Lora => {
            normalize_state_dict(&mut state_dict);
            report.adapter_tensors = Some(
                state_dict
                    .keys()
                    .filter_map(parse_normalized)
                    .filter(|(_, role)| *role != AdapterRole::Alpha)
                    .count(),
            );
            match detect_lora(&state_dict, args.force_version) {
                Ok((version, _)) => report.version = Some(version),
                Err(err) => report.detection_error = Some(err.to_string()),
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    log(level, LogLevel::Normal, &format!("{}:", args.input.display()));
    log(level, LogLevel::Normal, &format!("  Tensors: {}", report.tensors));
    log(
        level,
        LogLevel::Normal,
        &format!("  Parameters: {:.2}M", report.parameters as f64 / 1e6),
    );
    match (&report.version, &report.detection_error) {
        (Some(version), _) => log(level, LogLevel::Normal, &format!("  Version: {version}")),
        (None, Some(err)) => log(level, LogLevel::Normal, &format!("  Version: unknown ({err})")),
        (None, None) => {}
    }
    if let Some(count) = report.adapter_tensors {
        log(level, LogLevel::Normal, &format!("  Adapter tensors: {count}"));
    }
    for (dtype, count) in &report.dtypes {
        log(level, LogLevel::Verbose, &format!("  {dtype}: {count}"));
    }
    Ok(())
}
