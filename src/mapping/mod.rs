//! Architecture weight-mapping tables
//!
//! A [`ModelWeightMapping`] translates external checkpoint keys into canonical
//! parameter names. Tables are generated from data-only architecture configs
//! (see [`ArchitectureSpec`]) for each naming dialect:
//! - `GenerativeModels`: the original research code layout (`model.diffusion_model.*`,
//!   `double_blocks.*`, `joint_blocks.*`)
//! - `Diffusers`: the `diffusers` library layout (`down_blocks.*`,
//!   `transformer_blocks.*`)
//!
//! Canonical names are the GenerativeModels parameter paths (without the
//! `model.diffusion_model.` prefix). Fused tensors map to one canonical name
//! per packed sub-tensor.

mod architecture;
mod auraflow;
mod autoencoder;
mod controlnet;
mod element;
mod flux;
mod hunyuan;
mod mmdit;
mod pixart;
mod text;
mod unet;
mod upscaler;
mod wan;


pub use architecture::{ArchitectureSpec, MappingOptions};
pub use auraflow::AuraFlowConfig;
pub use autoencoder::AutoencoderConfig;
pub use controlnet::{
    controlnet_mapping, flux_controlnet_mapping, ControlNetMapping, ZERO_CONV_BIAS_SCALE,
};
pub use element::{validate_element, ModelWeightElement, SplitFormat};
pub use flux::FluxConfig;
pub use hunyuan::HunyuanConfig;
pub use mmdit::MMDiTConfig;
pub use pixart::PixArtConfig;
pub use text::{
    checkpoint_text_encoders, text_encoders, CheckpointTextEncoder, TextEncoderConfig,
    TextEncoderLayout, TextEncoderSlot, PROJECTION,
};
pub use unet::UNetConfig;
pub use upscaler::{rrdb_mapping, RRDBConfig};
pub use wan::WanConfig;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// External key to canonical element.
pub type ModelWeightMapping = BTreeMap<String, ModelWeightElement>;

/// Checkpoint naming dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamingFormat {
    GenerativeModels,
    Diffusers,
}

/// Tables for a denoising network and its precomputed ("fixed") half.
#[derive(Debug, Clone, Default)]
pub struct NetworkMapping {
    pub main: ModelWeightMapping,
    pub fixed: ModelWeightMapping,
}

impl NetworkMapping {
    /// Union with `other`; entries already present win.
    pub fn merge(&mut self, other: NetworkMapping) {
        for (key, value) in other.main {
            self.main.entry(key).or_insert(value);
        }
        for (key, value) in other.fixed {
            self.fixed.entry(key).or_insert(value);
        }
    }

    /// Distinct canonical names across both halves.
    pub fn canonical_names(&self) -> BTreeSet<String> {
        canonical_names(&self.main)
            .into_iter()
            .chain(canonical_names(&self.fixed))
            .collect()
    }
}

/// Distinct canonical names a table produces.
pub fn canonical_names(mapping: &ModelWeightMapping) -> BTreeSet<String> {
    mapping
        .values()
        .flat_map(|element| element.names.iter().cloned())
        .collect()
}

/// Which half of a network a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Half {
    Main,
    Fixed,
}

/// Accumulates table entries while an architecture walker runs.
#[derive(Debug)]
pub(crate) struct TableBuilder {
    naming: NamingFormat,
    external_prefix: &'static str,
    mapping: NetworkMapping,
}

impl TableBuilder {
    /// `external_prefix` is prepended to GenerativeModels keys only.
    pub(crate) fn new(naming: NamingFormat, external_prefix: &'static str) -> Self {
        Self {
            naming,
            external_prefix,
            mapping: NetworkMapping::default(),
        }
    }

    pub(crate) fn finish(self) -> NetworkMapping {
        self.mapping
    }

    fn table(&mut self, half: Half) -> &mut ModelWeightMapping {
        match half {
            Half::Main => &mut self.mapping.main,
            Half::Fixed => &mut self.mapping.fixed,
        }
    }

    fn external(&self, generative: &str, diffusers: &str) -> String {
        match self.naming {
            NamingFormat::GenerativeModels => format!("{}{generative}", self.external_prefix),
            NamingFormat::Diffusers => diffusers.to_string(),
        }
    }

    /// Raw parameter whose key has no `.weight`/`.bias` suffix.
    pub(crate) fn raw(&mut self, half: Half, generative: &str, diffusers: &str) {
        let key = self.external(generative, diffusers);
        self.table(half)
            .insert(key, ModelWeightElement::single(generative));
    }

    /// `.weight` only.
    pub(crate) fn weight(&mut self, half: Half, generative: &str, diffusers: &str) {
        self.raw(half, &format!("{generative}.weight"), &format!("{diffusers}.weight"));
    }

    /// `.weight` and `.bias`.
    pub(crate) fn linear(&mut self, half: Half, generative: &str, diffusers: &str) {
        self.weight(half, generative, diffusers);
        self.raw(half, &format!("{generative}.bias"), &format!("{diffusers}.bias"));
    }

    /// `.weight` and a `.bias` multiplied by `bias_scale` when written.
    pub(crate) fn linear_scaled_bias(
        &mut self,
        half: Half,
        generative: &str,
        diffusers: &str,
        bias_scale: f32,
    ) {
        self.weight(half, generative, diffusers);
        let name = format!("{generative}.bias");
        let key = self.external(&name, &format!("{diffusers}.bias"));
        self.table(half)
            .insert(key, ModelWeightElement::single(name).with_scale(bias_scale));
    }

    /// Tensor packed from several canonical parts along `format`.
    ///
    /// GenerativeModels names the packed tensor `generative`; Diffusers keeps
    /// one key per part. Canonical part names are `{parent}.{part}` where
    /// `parent` is `generative` without its last segment.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn fused(
        &mut self,
        half: Half,
        generative: &str,
        parts: &[&str],
        diffusers: &[&str],
        format: SplitFormat,
        offsets: Option<Vec<usize>>,
        bias: bool,
    ) {
        let parent = generative
            .rsplit_once('.')
            .map_or(generative, |(parent, _)| parent);
        let suffixes: &[&str] = if bias { &["weight", "bias"] } else { &["weight"] };
        for suffix in suffixes {
            let names: Vec<String> = parts
                .iter()
                .map(|part| format!("{parent}.{part}.{suffix}"))
                .collect();
            match self.naming {
                NamingFormat::GenerativeModels => {
                    // Biases of input-packed tensors belong to the output axis
                    // and are not split.
                    let element = if format == SplitFormat::I && *suffix == "bias" {
                        ModelWeightElement::single(names[0].clone())
                    } else {
                        let element = ModelWeightElement::fused(names, format);
                        match &offsets {
                            Some(offsets) => element.with_offsets(offsets.clone()),
                            None => element,
                        }
                    };
                    let key = format!("{}{generative}.{suffix}", self.external_prefix);
                    self.table(half).insert(key, element);
                }
                NamingFormat::Diffusers => {
                    if diffusers.len() == names.len() {
                        for (key, name) in diffusers.iter().zip(names) {
                            self.table(half)
                                .insert(format!("{key}.{suffix}"), ModelWeightElement::single(name));
                        }
                    } else if let Some(key) = diffusers.first() {
                        let element = if format == SplitFormat::I && *suffix == "bias" {
                            ModelWeightElement::single(names[0].clone())
                        } else {
                            let element = ModelWeightElement::fused(names, format);
                            match &offsets {
                                Some(offsets) => element.with_offsets(offsets.clone()),
                                None => element,
                            }
                        };
                        self.table(half).insert(format!("{key}.{suffix}"), element);
                    }
                }
            }
        }
    }
}

/// Underscore-flattened spellings of a network-table key.
///
/// `model.a.b.c.weight` yields `b_c.weight` and `a_b_c.weight`;
/// `diffusion_model.a.b.weight` yields `a_b.weight`; any other dotted key
/// yields its fully flattened form.
pub fn flattened_network_keys(key: &str) -> Vec<String> {
    let parts: Vec<&str> = key.split('.').collect();
    let n = parts.len();
    let join = |from: usize| format!("{}.{}", parts[from..n - 1].join("_"), parts[n - 1]);
    let mut keys = Vec::new();
    match parts.first() {
        Some(&"model") => {
            if n > 3 {
                keys.push(join(2));
            }
            if n > 2 {
                keys.push(join(1));
            }
        }
        Some(&"diffusion_model") => {
            if n > 2 {
                keys.push(join(1));
            }
        }
        _ => {
            if n > 1 {
                keys.push(join(0));
            }
        }
    }
    keys
}

/// Underscore-flattened spellings of a text-encoder key, dropping up to two
/// leading segments.
pub fn flattened_text_keys(key: &str) -> Vec<String> {
    let parts: Vec<&str> = key.split('.').collect();
    let n = parts.len();
    (0..=2)
        .filter(|&i| n > i + 1)
        .map(|i| format!("{}.{}", parts[i..n - 1].join("_"), parts[n - 1]))
        .collect()
}

/// Table extended with every flattened alias of its keys.
pub fn with_flattened_aliases(
    mapping: &ModelWeightMapping,
    flatten: fn(&str) -> Vec<String>,
) -> ModelWeightMapping {
    let mut out = mapping.clone();
    for (key, element) in mapping {
        for alias in flatten(key) {
            out.entry(alias).or_insert_with(|| element.clone());
        }
    }
    out
}
