//! Import configuration
//!
//! Loaded from YAML and validated before any archive is opened:
//!
//! ```yaml
//! scale_factor: 0.8
//! force_version: sdxl_base
//! precision: f16
//! report_skipped: true
//! export:
//!   name: my-style
//!   trigger_word: mystyle
//! ```

use crate::decompose::Decomposer;
use crate::error::{Error, Result};
use crate::store::Precision;
use crate::version::ModelVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings of the LoRA exporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    /// Value of the `name` metadata entry.
    pub name: Option<String>,
    /// Value of the `trigger_word` metadata entry.
    pub trigger_word: Option<String>,
}

/// Settings shared by every importer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    /// Global adapter strength; the product of every imported factor pair
    /// is multiplied by it.
    pub scale_factor: f32,
    /// Version used when detection finds no fingerprint, and preferred for
    /// transformer adapters whose fingerprint is shared with a derived model.
    pub force_version: Option<ModelVersion>,
    pub precision: Precision,
    /// Keep the list of unmapped adapter keys in the import result.
    pub report_skipped: bool,
    pub export: ExportConfig,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            force_version: None,
            precision: Precision::default(),
            report_skipped: false,
            export: ExportConfig::default(),
        }
    }
}

impl ImportConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.scale_factor.is_finite() || self.scale_factor <= 0.0 {
            return Err(Error::Config(format!(
                "scale_factor must be a positive number, got {}",
                self.scale_factor
            )));
        }
        for (field, value) in [
            ("export.name", &self.export.name),
            ("export.trigger_word", &self.export.trigger_word),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(Error::Config(format!("{field} cannot be empty")));
            }
        }
        Ok(())
    }

    pub fn decomposer(&self) -> Decomposer {
        Decomposer::new(self.scale_factor)
    }
}
