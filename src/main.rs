//! Importar CLI
//!
//! # Usage
//!
//! ```bash
//! # Classify a checkpoint
//! importar inspect model.safetensors
//!
//! # Import a full model and an adapter into one store
//! importar import-model model.safetensors --store weights.db
//! importar import-lora style.safetensors --store weights.db --scale 0.8
//!
//! # Import with a YAML config
//! importar --config import.yaml import-embedding emb.pt --store weights.db
//!
//! # Export the stored adapter again
//! importar export-lora --store weights.db --model-version sdxl_base --output style.safetensors
//! ```

use clap::Parser;
use importar::cli::{init_tracing, run_command, Cli};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level());

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_interrupted() => {
            eprintln!("Interrupted");
            ExitCode::from(130)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
