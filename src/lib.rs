//! Importar: checkpoint import and weight remapping for diffusion models
//!
//! Reads third-party checkpoints (safetensors files and pickled zip
//! archives), classifies their architecture and naming dialect, and writes
//! remapped tensors into a transactional SQLite store under canonical
//! parameter names.
//!
//! # Architecture
//!
//! - `archive`: container readers producing a [`StateDict`](archive::StateDict)
//! - `mapping`: per-architecture key tables and fused-tensor splitting
//! - `detect`: version and dialect fingerprints
//! - `normalize`: adapter key dialect normalization
//! - `decompose`: adapter factor scaling
//! - `importer`: model, LoRA, ControlNet, embedding and upscaler drivers
//! - `export`: store to LoRA safetensors
//! - `store`: SQLite tensor store
//!
//! # Example
//!
//! ```no_run
//! use importar::{import_lora, ImportConfig, ImportSession, TensorStore};
//!
//! let mut store = TensorStore::open("weights.db")?;
//! let config = ImportConfig::default();
//! let mut session = ImportSession::new().with_progress(|p| println!("{:.0}%", p * 100.0));
//! let result = import_lora("style.safetensors", &mut store, &config, &mut session)?;
//! println!("imported a {} adapter", result.version);
//! # Ok::<(), importar::Error>(())
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod decompose;
pub mod detect;
pub mod error;
pub mod export;
pub mod importer;
pub mod mapping;
pub mod normalize;
pub mod session;
pub mod store;
pub mod tensor;
pub mod version;

pub use config::{ExportConfig, ImportConfig};
pub use error::{Error, Result};
pub use export::{export_lora, ExportSummary};
pub use importer::{
    import_controlnet, import_embedding, import_lora, import_model, import_upscaler,
    ControlNetImport, EmbeddingImport, LoRAImport, ModelImport, UpscalerImport,
};
pub use session::{CancellationToken, ImportSession};
pub use store::{Precision, TensorStore};
pub use version::ModelVersion;
