//! CLIP text-encoder tables (Hugging Face `transformers` naming)

use super::{ModelWeightElement, ModelWeightMapping, SplitFormat};
use crate::version::ModelVersion;

/// Layout of a CLIP text transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEncoderConfig {
    pub layers: usize,
    pub hidden_size: usize,
    /// Pooled-output projection present.
    pub text_projection: bool,
}

impl TextEncoderConfig {
    /// CLIP ViT-L/14.
    pub fn clip_l() -> Self {
        Self {
            layers: 12,
            hidden_size: 768,
            text_projection: false,
        }
    }

    /// OpenCLIP ViT-H/14 with its last layer dropped.
    pub fn open_clip_h() -> Self {
        Self {
            layers: 23,
            hidden_size: 1024,
            text_projection: false,
        }
    }

    /// OpenCLIP ViT-bigG/14.
    pub fn open_clip_g() -> Self {
        Self {
            layers: 32,
            hidden_size: 1280,
            text_projection: true,
        }
    }

    /// Number of tensors a complete encoder carries.
    pub fn expected_tensors(&self) -> usize {
        4 + 16 * self.layers + usize::from(self.text_projection)
    }

    /// External key to identical canonical name.
    pub fn mapping(&self) -> ModelWeightMapping {
        let mut names = vec![
            "text_model.embeddings.token_embedding.weight".to_string(),
            "text_model.embeddings.position_embedding.weight".to_string(),
            "text_model.final_layer_norm.weight".to_string(),
            "text_model.final_layer_norm.bias".to_string(),
        ];
        for i in 0..self.layers {
            let layer = format!("text_model.encoder.layers.{i}");
            for module in [
                "self_attn.q_proj",
                "self_attn.k_proj",
                "self_attn.v_proj",
                "self_attn.out_proj",
                "layer_norm1",
                "layer_norm2",
                "mlp.fc1",
                "mlp.fc2",
            ] {
                names.push(format!("{layer}.{module}.weight"));
                names.push(format!("{layer}.{module}.bias"));
            }
        }
        if self.text_projection {
            names.push("text_projection.weight".to_string());
        }
        names
            .into_iter()
            .map(|name| (name.clone(), ModelWeightElement::single(name)))
            .collect()
    }
}

/// Which encoder of a dual-encoder model a tensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextEncoderSlot {
    First,
    Second,
}

impl TextEncoderSlot {
    /// Store prefix of the encoder.
    pub fn store_prefix(self) -> &'static str {
        match self {
            TextEncoderSlot::First => "text_model",
            TextEncoderSlot::Second => "te2__text_model",
        }
    }

    /// Key prefix adapters use for the encoder.
    pub fn adapter_prefix(self) -> &'static str {
        match self {
            TextEncoderSlot::First => "lora_te1_",
            TextEncoderSlot::Second => "lora_te2_",
        }
    }
}

/// Key layout of a text encoder inside a single-file checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoderLayout {
    /// `transformers` names under `{prefix}text_model.`.
    Transformers,
    /// OpenCLIP names with packed attention inputs and a transposed projection.
    OpenClip,
}

/// A text encoder bundled in a single-file checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointTextEncoder {
    pub slot: TextEncoderSlot,
    pub config: TextEncoderConfig,
    /// Key prefix of the encoder inside the checkpoint.
    pub prefix: &'static str,
    pub layout: TextEncoderLayout,
}

impl CheckpointTextEncoder {
    /// Checkpoint key to canonical name, projection excluded.
    pub fn mapping(&self) -> ModelWeightMapping {
        let prefix = self.prefix;
        match self.layout {
            TextEncoderLayout::Transformers => self
                .config
                .mapping()
                .into_iter()
                .filter(|(key, _)| key != PROJECTION)
                .map(|(key, element)| (format!("{prefix}{key}"), element))
                .collect(),
            TextEncoderLayout::OpenClip => self.open_clip_mapping(),
        }
    }

    fn open_clip_mapping(&self) -> ModelWeightMapping {
        let prefix = self.prefix;
        let mut mapping = ModelWeightMapping::new();
        for (key, name) in [
            ("token_embedding.weight", "embeddings.token_embedding.weight"),
            ("positional_embedding", "embeddings.position_embedding.weight"),
            ("ln_final.weight", "final_layer_norm.weight"),
            ("ln_final.bias", "final_layer_norm.bias"),
        ] {
            mapping.insert(
                format!("{prefix}{key}"),
                ModelWeightElement::single(format!("text_model.{name}")),
            );
        }
        for i in 0..self.config.layers {
            let block = format!("{prefix}transformer.resblocks.{i}");
            let layer = format!("text_model.encoder.layers.{i}");
            for suffix in ["weight", "bias"] {
                for (g, d) in [
                    ("attn.out_proj", "self_attn.out_proj"),
                    ("ln_1", "layer_norm1"),
                    ("ln_2", "layer_norm2"),
                    ("mlp.c_fc", "mlp.fc1"),
                    ("mlp.c_proj", "mlp.fc2"),
                ] {
                    mapping.insert(
                        format!("{block}.{g}.{suffix}"),
                        ModelWeightElement::single(format!("{layer}.{d}.{suffix}")),
                    );
                }
                let names = ["q_proj", "k_proj", "v_proj"]
                    .iter()
                    .map(|p| format!("{layer}.self_attn.{p}.{suffix}"))
                    .collect();
                mapping.insert(
                    format!("{block}.attn.in_proj_{suffix}"),
                    ModelWeightElement::fused(names, SplitFormat::O),
                );
            }
        }
        mapping
    }

    /// Checkpoint key of the pooled-output projection, when the encoder has one.
    pub fn projection_key(&self) -> Option<String> {
        if !self.config.text_projection {
            return None;
        }
        Some(match self.layout {
            TextEncoderLayout::Transformers => format!("{}{PROJECTION}", self.prefix),
            TextEncoderLayout::OpenClip => format!("{}text_projection", self.prefix),
        })
    }

    /// OpenCLIP stores the projection as `[width, projection]`.
    pub fn projection_transposed(&self) -> bool {
        self.layout == TextEncoderLayout::OpenClip
    }
}

/// Canonical name of the pooled-output projection.
pub const PROJECTION: &str = "text_projection.weight";

/// Text encoders bundled in single-file checkpoints of `version`.
pub fn checkpoint_text_encoders(version: ModelVersion) -> Vec<CheckpointTextEncoder> {
    use TextEncoderLayout::{OpenClip, Transformers};
    let encoder = |slot, config, prefix, layout| CheckpointTextEncoder {
        slot,
        config,
        prefix,
        layout,
    };
    match version {
        ModelVersion::V1 => vec![encoder(
            TextEncoderSlot::First,
            TextEncoderConfig::clip_l(),
            "cond_stage_model.transformer.",
            Transformers,
        )],
        ModelVersion::V2 => vec![encoder(
            TextEncoderSlot::First,
            TextEncoderConfig::open_clip_h(),
            "cond_stage_model.model.",
            OpenClip,
        )],
        ModelVersion::SdxlBase | ModelVersion::Ssd1b => vec![
            encoder(
                TextEncoderSlot::First,
                TextEncoderConfig::clip_l(),
                "conditioner.embedders.0.transformer.",
                Transformers,
            ),
            encoder(
                TextEncoderSlot::Second,
                TextEncoderConfig::open_clip_g(),
                "conditioner.embedders.1.model.",
                OpenClip,
            ),
        ],
        ModelVersion::SdxlRefiner => vec![encoder(
            TextEncoderSlot::First,
            TextEncoderConfig::open_clip_g(),
            "conditioner.embedders.0.model.",
            OpenClip,
        )],
        _ => Vec::new(),
    }
}

/// Text encoders whose adapter weights can be imported for `version`.
pub fn text_encoders(version: ModelVersion) -> (Option<TextEncoderConfig>, Option<TextEncoderConfig>) {
    match version {
        ModelVersion::V1 => (Some(TextEncoderConfig::clip_l()), None),
        ModelVersion::V2 => (Some(TextEncoderConfig::open_clip_h()), None),
        ModelVersion::SdxlBase | ModelVersion::Ssd1b => (
            Some(TextEncoderConfig::clip_l()),
            Some(TextEncoderConfig::open_clip_g()),
        ),
        ModelVersion::SdxlRefiner => (Some(TextEncoderConfig::open_clip_g()), None),
        _ => (None, None),
    }
}
