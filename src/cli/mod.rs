//! Command-line interface
//!
//! Argument types are declared with `clap` derive; each subcommand is
//! handled in [`commands`].

mod commands;
mod logging;


pub use commands::run_command;
pub use logging::{init_tracing, LogLevel};

use crate::config::ImportConfig;
use crate::error::Result;
use crate::store::Precision;
use crate::version::ModelVersion;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Importar: checkpoint import for diffusion models
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "importar")]
#[command(version)]
#[command(about = "Import diffusion checkpoints, LoRAs, ControlNets, embeddings and upscalers into a tensor store")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// YAML import configuration
    #[arg(short, long, global = true, value_name = "YAML")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl Cli {
    /// Output level selected by `--quiet` and `--verbose`.
    pub fn log_level(&self) -> LogLevel {
        if self.quiet {
            LogLevel::Quiet
        } else if self.verbose {
            LogLevel::Verbose
        } else {
            LogLevel::Normal
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show what a checkpoint contains and how it would be classified
    Inspect(InspectArgs),

    /// Import the denoising network of a full checkpoint
    ImportModel(ImportArgs),

    /// Import a LoRA, LoHa or dense-diff adapter
    ImportLora(ImportArgs),

    /// Import a ControlNet
    ImportControlnet(ImportArgs),

    /// Import a textual-inversion embedding
    ImportEmbedding(ImportArgs),

    /// Import an ESRGAN upscaler
    ImportUpscaler(ImportArgs),

    /// Export the adapter held in a store as a LoRA file
    ExportLora(ExportArgs),
}

/// How `inspect` classifies the file.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InspectKind {
    #[default]
    Model,
    Lora,
}

/// Arguments for the inspect command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InspectArgs {
    /// Checkpoint to inspect
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Classify as a full model or an adapter
    #[arg(long = "as", value_enum, default_value_t)]
    pub kind: InspectKind,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Override version detection
    #[arg(long)]
    pub force_version: Option<ModelVersion>,
}

/// Stored tensor precision on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionArg {
    F16,
    F32,
}

impl From<PrecisionArg> for Precision {
    fn from(arg: PrecisionArg) -> Self {
        match arg {
            PrecisionArg::F16 => Precision::F16,
            PrecisionArg::F32 => Precision::F32,
        }
    }
}

/// Flags overriding the YAML configuration
#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct ConfigOverrides {
    /// Multiply imported adapter deltas by this factor
    #[arg(long)]
    pub scale: Option<f32>,

    /// Override version detection
    #[arg(long)]
    pub force_version: Option<ModelVersion>,

    /// Precision of stored tensors
    #[arg(long, value_enum)]
    pub precision: Option<PrecisionArg>,

    /// List adapter keys that matched no mapping table
    #[arg(long)]
    pub report_skipped: bool,
}

impl ConfigOverrides {
    /// Apply every flag that was given on top of `config`.
    pub fn apply(&self, config: &mut ImportConfig) {
        if let Some(scale) = self.scale {
            config.scale_factor = scale;
        }
        if let Some(version) = self.force_version {
            config.force_version = Some(version);
        }
        if let Some(precision) = self.precision {
            config.precision = precision.into();
        }
        if self.report_skipped {
            config.report_skipped = true;
        }
    }
}

/// Arguments shared by the import commands
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ImportArgs {
    /// Checkpoint to import
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Destination tensor store
    #[arg(short, long, value_name = "DB")]
    pub store: PathBuf,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Arguments for the export-lora command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ExportArgs {
    /// Tensor store holding the adapter
    #[arg(short, long, value_name = "DB")]
    pub store: PathBuf,

    /// Model version the adapter targets
    #[arg(long = "model-version")]
    pub version: ModelVersion,

    /// Output safetensors file
    #[arg(short, long)]
    pub output: PathBuf,

    /// Adapter name written into the metadata
    #[arg(long)]
    pub name: Option<String>,

    /// Trigger word written into the metadata
    #[arg(long)]
    pub trigger_word: Option<String>,
}

/// Parse command line arguments
pub fn parse_args<I, T>(args: I) -> std::result::Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Configuration from `--config` (or defaults) with `overrides` applied,
/// validated.
pub fn resolve_config(cli: &Cli, overrides: &ConfigOverrides) -> Result<ImportConfig> {
    let mut config = match &cli.config {
        Some(path) => ImportConfig::load(path)?,
        None => ImportConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}
