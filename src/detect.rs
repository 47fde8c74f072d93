//! Architecture and dialect detection from state-dict fingerprints.
//!
//! Each detector inspects a handful of keys (and the trailing dimension of a
//! cross-attention or embedding tensor) that only exist in one architecture.
//! Overlapping fingerprints are resolved by a fixed priority order; when
//! nothing matches, a caller-supplied override is used, otherwise detection
//! fails with [`Error::ModelVersionFailed`].

use crate::archive::{StateDict, TensorDescriptor};
use crate::error::{Error, Result};
use crate::mapping::{MappingOptions, NamingFormat};
use crate::version::{ModelVersion, SamplerModifier};
use serde::{Deserialize, Serialize};

/// What a full checkpoint was found to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInspection {
    pub version: ModelVersion,
    pub modifier: SamplerModifier,
    pub naming: NamingFormat,
    pub options: MappingOptions,
    /// SD v2 unCLIP-style image projection present.
    pub has_encoder_hid_proj: bool,
}

/// First descriptor whose key ends with one of `suffixes`, tried in order.
fn find_suffix<'a>(state_dict: &'a StateDict, suffixes: &[&str]) -> Option<&'a TensorDescriptor> {
    suffixes.iter().find_map(|suffix| {
        state_dict
            .iter()
            .find(|(key, _)| key.ends_with(suffix))
            .map(|(_, descriptor)| descriptor)
    })
}

fn any_contains(state_dict: &StateDict, needles: &[&str]) -> bool {
    needles.iter().any(|needle| state_dict.any_key_contains(needle))
}

/// SD3 query/key norms, in dotted or flattened spelling.
fn has_qk_norm(state_dict: &StateDict) -> bool {
    any_contains(
        state_dict,
        &[
            ".ln_k.", ".ln_q.", ".norm_k.", ".norm_q.", "_ln_k.", "_ln_q.", "_norm_k.", "_norm_q.",
            "_ln_k_", "_ln_q_", "_norm_k_", "_norm_q_",
        ],
    )
}

/// SD3.5 blocks with a second image self-attention.
///
/// Adapters that train the image modulation reveal it through the row
/// count of its up factor (nine chunks instead of six); otherwise the
/// `attn2` projections give it away.
fn dual_attention_layers(state_dict: &StateDict) -> Vec<usize> {
    (0..38)
        .filter(|&i| {
            let modulation = state_dict.iter().find(|(key, _)| {
                key.ends_with("lora_up.weight")
                    && (key.contains(&format!("joint_blocks_{i}_x_block_adaLN_modulation_1"))
                        || key.contains(&format!("transformer_blocks_{i}_norm1_linear")))
            });
            match modulation {
                Some((_, descriptor)) => descriptor.shape.first() == Some(&(1536 * 9)),
                None => [
                    format!(".{i}.x_block.attn2."),
                    format!("_blocks.{i}.attn2."),
                    format!("_{i}_x_block_attn2_"),
                    format!("_blocks_{i}_attn2_"),
                ]
                .iter()
                .any(|needle| state_dict.any_key_contains(needle)),
            }
        })
        .collect()
}

fn mapping_options(state_dict: &StateDict) -> MappingOptions {
    MappingOptions {
        qk_norm: has_qk_norm(state_dict),
        dual_attention_layers: dual_attention_layers(state_dict),
        image_conditioning: any_contains(
            state_dict,
            &["cross_attn.v_img.", "cross_attn_v_img", "attn2.add_v_proj.", "attn2_add_v_proj"],
        ),
        guidance_embed: any_contains(
            state_dict,
            &[".guidance_embedder.", "guidance_in.", "guidance_embedder_", "guidance_in_"],
        ),
    }
}

/// SDXL base and SSD-1B share a context width; the distilled model drops
/// the middle attention block.
fn sdxl_or_ssd1b(has_mid_attention: bool, force_version: Option<ModelVersion>) -> ModelVersion {
    match force_version {
        Some(forced @ (ModelVersion::SdxlBase | ModelVersion::Ssd1b)) => forced,
        _ if has_mid_attention => ModelVersion::SdxlBase,
        _ => ModelVersion::Ssd1b,
    }
}

/// A DiT fingerprint: the version it identifies, the marker keys of which one
/// must match, and markers that must all be absent.
struct Fingerprint {
    version: ModelVersion,
    any: &'static [&'static str],
    exclude: &'static [&'static str],
    /// A marker only counts in keys not containing this segment.
    unless_key_contains: Option<&'static str>,
}

impl Fingerprint {
    fn matches(&self, state_dict: &StateDict) -> bool {
        let hit = |needle: &str| {
            state_dict.keys().any(|key| {
                key.contains(needle)
                    && self
                        .unless_key_contains
                        .map_or(true, |skip| !key.contains(skip))
            })
        };
        self.any.iter().any(|needle| hit(needle))
            && !any_contains(state_dict, self.exclude)
    }
}

const MODEL_FINGERPRINTS: &[Fingerprint] = &[
    Fingerprint {
        version: ModelVersion::Sd3Large,
        any: &["joint_blocks.37.context_block.", "transformer_blocks.36.ff_context."],
        exclude: &[],
        unless_key_contains: Some("single_transformer_blocks"),
    },
    Fingerprint {
        version: ModelVersion::Sd3,
        any: &["joint_blocks.23.context_block.", "transformer_blocks.22.ff_context."],
        exclude: &[],
        unless_key_contains: Some("single_transformer_blocks"),
    },
    Fingerprint {
        version: ModelVersion::Pixart,
        any: &["blocks.27.cross_attn.kv_", "transformer_blocks.27.attn2.to_"],
        exclude: &["blocks.28."],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::HunyuanVideo,
        any: &["double_blocks.19.img_attn_qkv.", "single_transformer_blocks.39.linear1."],
        exclude: &[],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::Flux1,
        any: &["double_blocks.18.img_attn.qkv.", "single_transformer_blocks.37.proj_mlp."],
        exclude: &[],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::Auraflow,
        any: &["double_layers.3.attn.w2q.", "transformer_blocks.3.attn.add_q_proj."],
        exclude: &[],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::Wan21_14b,
        any: &["blocks.39.cross_attn.v.", "blocks.39.attn2.to_v."],
        exclude: &[],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::Wan21_1_3b,
        any: &["blocks.29.cross_attn.v.", "blocks.29.attn2.to_v."],
        exclude: &[],
        unless_key_contains: None,
    },
];

/// AuraFlow needs both its joint and single stacks present.
fn auraflow_complete(state_dict: &StateDict) -> bool {
    any_contains(
        state_dict,
        &["single_layers.31.attn.w1q.", "single_transformer_blocks.31.attn.to_q."],
    )
}

fn dit_naming(version: ModelVersion, state_dict: &StateDict) -> NamingFormat {
    let marker = match version {
        ModelVersion::Sd3Large => "transformer_blocks.36.ff_context.",
        ModelVersion::Sd3 => "transformer_blocks.22.ff_context.",
        ModelVersion::Pixart => "transformer_blocks.27.",
        ModelVersion::HunyuanVideo => "single_transformer_blocks.39.",
        ModelVersion::Auraflow => "single_transformer_blocks.31.attn.",
        ModelVersion::Flux1 => "single_transformer_blocks.37.",
        ModelVersion::Wan21_14b => "blocks.39.attn2.to_v.",
        ModelVersion::Wan21_1_3b => "blocks.29.attn2.to_v.",
        _ => "mid_block.",
    };
    if state_dict.any_key_contains(marker) {
        NamingFormat::Diffusers
    } else {
        NamingFormat::GenerativeModels
    }
}

fn detect_unet(
    state_dict: &StateDict,
    force_version: Option<ModelVersion>,
) -> Option<(ModelVersion, SamplerModifier)> {
    let cross_attention = [
        "model.diffusion_model.input_blocks.4.1.transformer_blocks.0.attn2.to_k.weight",
        "down_blocks.1.attentions.0.transformer_blocks.0.attn2.to_k.weight",
    ]
    .iter()
    .find_map(|key| state_dict.get(key))?;
    let input_conv = ["model.diffusion_model.input_blocks.0.0.weight", "conv_in.weight"]
        .iter()
        .find_map(|key| state_dict.get(key))?;

    let has_mid_attention = any_contains(
        state_dict,
        &["mid_block.attentions.0.transformer_blocks.", "middle_block.1.transformer_blocks."],
    );
    let version = match cross_attention.last_dim()? {
        768 => ModelVersion::V1,
        1024 => ModelVersion::V2,
        1280 => ModelVersion::SdxlRefiner,
        2048 => sdxl_or_ssd1b(has_mid_attention, force_version),
        _ => return None,
    };
    let modifier = input_conv
        .shape
        .get(1)
        .map_or(SamplerModifier::None, |&c| SamplerModifier::from_input_channels(c));
    Some((version, modifier))
}

/// Classify a full checkpoint.
pub fn detect_model(
    state_dict: &StateDict,
    force_version: Option<ModelVersion>,
) -> Result<ModelInspection> {
    let has_encoder_hid_proj = state_dict.contains_key("encoder_hid_proj.weight");
    if let Some((version, modifier)) = detect_unet(state_dict, force_version) {
        let naming = if state_dict.any_key_starts_with("mid_block.") {
            NamingFormat::Diffusers
        } else {
            NamingFormat::GenerativeModels
        };
        tracing::debug!(%version, ?naming, ?modifier, "detected UNet checkpoint");
        return Ok(ModelInspection {
            version,
            modifier,
            naming,
            options: MappingOptions::default(),
            has_encoder_hid_proj,
        });
    }

    let detected = MODEL_FINGERPRINTS
        .iter()
        .filter(|fp| fp.version != ModelVersion::Auraflow || auraflow_complete(state_dict))
        .find(|fp| fp.matches(state_dict))
        .map(|fp| fp.version);
    let version = detected.or(force_version).ok_or(Error::ModelVersionFailed)?;
    let options = mapping_options(state_dict);
    let modifier = match version {
        ModelVersion::Flux1 => ["img_in.weight", "x_embedder.weight"]
            .iter()
            .find_map(|key| state_dict.get(key))
            .and_then(|d| d.last_dim())
            .map_or(SamplerModifier::None, |width| match width {
                384 => SamplerModifier::Inpainting,
                128 => SamplerModifier::Depth,
                _ => SamplerModifier::None,
            }),
        ModelVersion::Wan21_14b | ModelVersion::Wan21_1_3b if options.image_conditioning => {
            SamplerModifier::Inpainting
        }
        _ => SamplerModifier::None,
    };
    let naming = dit_naming(version, state_dict);
    tracing::debug!(%version, ?naming, ?modifier, "detected transformer checkpoint");
    Ok(ModelInspection {
        version,
        modifier,
        naming,
        options,
        has_encoder_hid_proj,
    })
}

const LORA_FINGERPRINTS: &[Fingerprint] = &[
    Fingerprint {
        version: ModelVersion::Sd3Large,
        any: &[
            "joint_blocks_37_attn_",
            "joint_blocks_37_x_block_attn_",
            "transformer_blocks_37_attn_",
        ],
        exclude: &[],
        unless_key_contains: Some("single_transformer_blocks"),
    },
    Fingerprint {
        version: ModelVersion::Sd3,
        any: &["joint_blocks_23_context_block_", "transformer_blocks_22_ff_context_"],
        exclude: &[],
        unless_key_contains: Some("single_transformer_blocks"),
    },
    Fingerprint {
        version: ModelVersion::Pixart,
        any: &["blocks_27_cross_attn_kv_", "transformer_blocks_27_attn2_to_"],
        exclude: &["blocks_28_", "blocks.28."],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::HunyuanVideo,
        any: &[
            "double_blocks.19.img_attn_qkv.",
            "double_blocks_19_img_attn_qkv.",
            "double_blocks.19.img_attn.qkv.",
            "single_transformer_blocks_39_",
        ],
        exclude: &[],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::Flux1,
        any: &[
            "double_blocks.18.img_attn.qkv.",
            "double_blocks_18_img_attn_qkv.",
            "single_transformer_blocks_37_",
        ],
        exclude: &[],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::Wan21_14b,
        any: &["blocks.39.cross_attn.v.", "blocks_39_cross_attn_v.", "blocks_39_attn2_to_v."],
        exclude: &[],
        unless_key_contains: None,
    },
    Fingerprint {
        version: ModelVersion::Wan21_1_3b,
        any: &["blocks.29.cross_attn.v.", "blocks_29_cross_attn_v.", "blocks_29_attn2_to_v."],
        exclude: &[],
        unless_key_contains: None,
    },
];

/// Version and table options of an adapter, read from normalized keys.
pub fn detect_lora(
    state_dict: &StateDict,
    force_version: Option<ModelVersion>,
) -> Result<(ModelVersion, MappingOptions)> {
    let options = mapping_options(state_dict);
    if let Some(fp) = LORA_FINGERPRINTS.iter().find(|fp| fp.matches(state_dict)) {
        // Derived DiT models share fingerprints with their base, so an
        // explicit transformer override wins.
        let version = match force_version {
            Some(forced) if !forced.is_unet_family() => forced,
            _ => fp.version,
        };
        tracing::debug!(%version, detected = %fp.version, "detected transformer adapter");
        return Ok((version, options));
    }

    let marker = find_suffix(
        state_dict,
        &[
            "down_blocks_1_attentions_0_transformer_blocks_0_attn2_to_k.lora_down.weight",
            "up_blocks_1_attentions_0_transformer_blocks_0_attn2_to_k.lora_down.weight",
            "input_blocks_4_1_transformer_blocks_0_attn2_to_k.lora_down.weight",
            "down_blocks_1_attentions_0_transformer_blocks_0_attn2_to_k.hada_w1_b",
            "up_blocks_1_attentions_0_transformer_blocks_0_attn2_to_k.hada_w1_b",
            "input_blocks_4_1_transformer_blocks_0_attn2_to_k.hada_w1_b",
        ],
    )
    .or_else(|| {
        find_suffix(
            state_dict,
            &[
                "encoder_layers_0_self_attn_k_proj.lora_down.weight",
                "encoder_layers_0_self_attn_k_proj.hada_w1_b",
            ],
        )
    });
    let has_mid_attention = any_contains(
        state_dict,
        &["mid_block_attentions_0_transformer_blocks_", "middle_block_1_transformer_blocks_"],
    );
    let detected = marker.and_then(|d| d.last_dim()).and_then(|width| match width {
        768 if state_dict.any_key_contains("lora_te2_") => Some(ModelVersion::SdxlBase),
        768 => Some(ModelVersion::V1),
        1024 => Some(ModelVersion::V2),
        1280 => Some(ModelVersion::SdxlRefiner),
        2048 => Some(sdxl_or_ssd1b(has_mid_attention, force_version)),
        _ => None,
    });
    let version = detected.or(force_version).ok_or(Error::ModelVersionFailed)?;
    tracing::debug!(%version, "detected UNet adapter");
    Ok((version, options))
}

/// Whether an SDXL adapter labels its encoders the other way around.
///
/// `lora_te1_` should hold CLIP-L (768 wide) and `lora_te2_` OpenCLIP-G
/// (1280 wide); some trainers write them swapped.
pub fn sdxl_text_encoders_swapped(state_dict: &StateDict) -> bool {
    let width = |prefix: &str| {
        let down = format!("{prefix}encoder_layers_0_self_attn_k_proj.lora_down.weight");
        let hada = format!("{prefix}encoder_layers_0_self_attn_k_proj.hada_w1_b");
        find_suffix(state_dict, &[down.as_str(), hada.as_str()]).and_then(|d| d.last_dim())
    };
    let te1 = width("lora_te1_").or_else(|| width("lora_te_"));
    let te2 = width("lora_te2_");
    matches!((te1, te2), (Some(1280), _) | (_, Some(768)))
}

/// ControlNet flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlNetKind {
    ControlNet,
    /// Multi-condition ControlNet with a control-type embedding.
    ControlNetUnion,
}

/// Network layout a ControlNet copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlNetLayout {
    /// UNet encoder; depths are `None` when they follow the base model.
    UNet {
        level1_depth: Option<usize>,
        level2_depth: Option<usize>,
        middle_depth: Option<usize>,
    },
    /// FLUX.1 blocks.
    Flux { double: usize, single: usize },
}

/// What a ControlNet checkpoint was found to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlNetInspection {
    pub version: ModelVersion,
    pub kind: ControlNetKind,
    pub naming: NamingFormat,
    pub layout: ControlNetLayout,
}

fn count_blocks(state_dict: &StateDict, limit: usize, key: impl Fn(usize) -> String) -> usize {
    (0..limit)
        .take_while(|&i| state_dict.contains_key(&key(i)))
        .count()
}

/// Classify a ControlNet checkpoint whose keys carry the
/// `model.control_model.` prefix (or no prefix for Diffusers).
pub fn detect_controlnet(state_dict: &StateDict) -> Result<ControlNetInspection> {
    let marker = find_suffix(
        state_dict,
        &[
            "transformer_blocks.0.attn2.to_k.weight",
            "add_embedding.linear_1.weight",
            "label_emb.0.0.weight",
        ],
    );
    let Some(marker) = marker else {
        let double = count_blocks(state_dict, 19, |i| {
            format!("transformer_blocks.{i}.attn.to_k.weight")
        });
        let single = count_blocks(state_dict, 38, |i| {
            format!("single_transformer_blocks.{i}.attn.to_k.weight")
        });
        if double == 0 && single == 0 {
            return Err(Error::tensor_not_found("transformer_blocks.0.attn2.to_k.weight"));
        }
        let kind = if state_dict.contains_key("controlnet_mode_embedder.weight") {
            ControlNetKind::ControlNetUnion
        } else {
            ControlNetKind::ControlNet
        };
        tracing::debug!(double, single, ?kind, "detected FLUX.1 ControlNet");
        return Ok(ControlNetInspection {
            version: ModelVersion::Flux1,
            kind,
            naming: NamingFormat::Diffusers,
            layout: ControlNetLayout::Flux { double, single },
        });
    };

    let version = match marker.last_dim() {
        Some(768) => ModelVersion::V1,
        Some(1024) => ModelVersion::V2,
        Some(2048 | 2816) => ModelVersion::SdxlBase,
        Some(1280 | 2560) => {
            return Err(Error::UnsupportedModel(
                "SDXL refiner ControlNet".to_string(),
            ))
        }
        _ => return Err(Error::ModelVersionFailed),
    };
    let naming = if state_dict.any_key_starts_with("controlnet_down_blocks.")
        || state_dict.any_key_starts_with("down_blocks.")
    {
        NamingFormat::Diffusers
    } else {
        NamingFormat::GenerativeModels
    };
    let layout = if version == ModelVersion::SdxlBase && naming == NamingFormat::Diffusers {
        let depth = |prefix: &str, limit: usize| {
            Some(count_blocks(state_dict, limit, |i| {
                format!("{prefix}.transformer_blocks.{i}.attn2.to_k.weight")
            }))
        };
        ControlNetLayout::UNet {
            level1_depth: depth("down_blocks.1.attentions.0", 2),
            level2_depth: depth("down_blocks.2.attentions.0", 10),
            middle_depth: depth("mid_block.attentions.0", 10),
        }
    } else {
        ControlNetLayout::UNet {
            level1_depth: None,
            level2_depth: None,
            middle_depth: None,
        }
    };
    let kind = if state_dict.contains_key("control_add_embedding.linear_1.weight") {
        ControlNetKind::ControlNetUnion
    } else {
        ControlNetKind::ControlNet
    };
    tracing::debug!(%version, ?naming, ?kind, "detected UNet ControlNet");
    Ok(ControlNetInspection {
        version,
        kind,
        naming,
        layout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{DType, DataLocation};

    fn state_dict(entries: &[(&str, &[usize])]) -> StateDict {
        let mut sd = StateDict::new();
        for (key, shape) in entries {
            sd.insert(
                *key,
                TensorDescriptor {
                    key: key.to_string(),
                    shape: shape.to_vec(),
                    dtype: DType::F32,
                    location: DataLocation::Range { start: 0, end: 0 },
                },
            );
        }
        sd
    }

    #[test]
    fn test_sd_family_by_context_width() {
        let cases = [
            (768, ModelVersion::V1),
            (1024, ModelVersion::V2),
            (1280, ModelVersion::SdxlRefiner),
        ];
        for (width, expected) in cases {
            let sd = state_dict(&[
                ("model.diffusion_model.input_blocks.0.0.weight", &[320, 9, 3, 3]),
                (
                    "model.diffusion_model.input_blocks.4.1.transformer_blocks.0.attn2.to_k.weight",
                    &[640, width],
                ),
            ]);
            let inspection = detect_model(&sd, None).unwrap();
            assert_eq!(inspection.version, expected);
            assert_eq!(inspection.modifier, SamplerModifier::Inpainting);
            assert_eq!(inspection.naming, NamingFormat::GenerativeModels);
        }
    }

    #[test]
    fn test_sdxl_base_versus_ssd1b() {
        let base = state_dict(&[
            ("conv_in.weight", &[320, 4, 3, 3]),
            ("down_blocks.1.attentions.0.transformer_blocks.0.attn2.to_k.weight", &[640, 2048]),
            ("mid_block.attentions.0.transformer_blocks.0.attn2.to_k.weight", &[1280, 2048]),
        ]);
        let inspection = detect_model(&base, None).unwrap();
        assert_eq!(inspection.version, ModelVersion::SdxlBase);
        assert_eq!(inspection.naming, NamingFormat::Diffusers);

        let distilled = state_dict(&[
            ("conv_in.weight", &[320, 4, 3, 3]),
            ("down_blocks.1.attentions.0.transformer_blocks.0.attn2.to_k.weight", &[640, 2048]),
            ("mid_block.resnets.0.conv1.weight", &[1280, 1280, 3, 3]),
        ]);
        assert_eq!(detect_model(&distilled, None).unwrap().version, ModelVersion::Ssd1b);
        assert_eq!(
            detect_model(&distilled, Some(ModelVersion::SdxlBase)).unwrap().version,
            ModelVersion::SdxlBase
        );
    }

    #[test]
    fn test_dit_priorities() {
        let large = state_dict(&[
            ("model.diffusion_model.joint_blocks.23.context_block.attn.qkv.weight", &[1, 1]),
            ("model.diffusion_model.joint_blocks.37.context_block.attn.qkv.weight", &[1, 1]),
            ("model.diffusion_model.joint_blocks.0.x_block.attn.ln_k.weight", &[64]),
        ]);
        let inspection = detect_model(&large, None).unwrap();
        assert_eq!(inspection.version, ModelVersion::Sd3Large);
        assert!(inspection.options.qk_norm);

        let hunyuan = state_dict(&[
            ("double_blocks.19.img_attn_qkv.weight", &[1, 1]),
            ("double_blocks.18.img_attn.qkv.weight", &[1, 1]),
        ]);
        assert_eq!(detect_model(&hunyuan, None).unwrap().version, ModelVersion::HunyuanVideo);

        let wan = state_dict(&[
            ("blocks.29.cross_attn.v.weight", &[1, 1]),
            ("blocks.39.cross_attn.v.weight", &[1, 1]),
            ("blocks.39.cross_attn.v_img.weight", &[1, 1]),
        ]);
        let inspection = detect_model(&wan, None).unwrap();
        assert_eq!(inspection.version, ModelVersion::Wan21_14b);
        assert_eq!(inspection.modifier, SamplerModifier::Inpainting);
    }

    #[test]
    fn test_flux_modifier_and_dialect() {
        let sd = state_dict(&[
            ("single_transformer_blocks.37.proj_mlp.weight", &[12288, 3072]),
            ("x_embedder.weight", &[3072, 384]),
            ("time_text_embed.guidance_embedder.linear_1.weight", &[3072, 256]),
        ]);
        let inspection = detect_model(&sd, None).unwrap();
        assert_eq!(inspection.version, ModelVersion::Flux1);
        assert_eq!(inspection.naming, NamingFormat::Diffusers);
        assert_eq!(inspection.modifier, SamplerModifier::Inpainting);
        assert!(inspection.options.guidance_embed);
    }

    #[test]
    fn test_auraflow_needs_both_stacks() {
        let joint_only = state_dict(&[("model.double_layers.3.attn.w2q.weight", &[1, 1])]);
        assert!(matches!(
            detect_model(&joint_only, None),
            Err(Error::ModelVersionFailed)
        ));
        let full = state_dict(&[
            ("model.double_layers.3.attn.w2q.weight", &[1, 1]),
            ("model.single_layers.31.attn.w1q.weight", &[1, 1]),
        ]);
        assert_eq!(detect_model(&full, None).unwrap().version, ModelVersion::Auraflow);
    }

    #[test]
    fn test_override_when_nothing_matches() {
        let sd = state_dict(&[("unrelated.weight", &[4])]);
        assert!(matches!(detect_model(&sd, None), Err(Error::ModelVersionFailed)));
        assert_eq!(
            detect_model(&sd, Some(ModelVersion::Pixart)).unwrap().version,
            ModelVersion::Pixart
        );
    }

    #[test]
    fn test_lora_sd_markers() {
        let sdxl = state_dict(&[
            (
                "lora_unet_input_blocks_4_1_transformer_blocks_0_attn2_to_k.lora_down.weight",
                &[8, 2048],
            ),
            ("lora_unet_middle_block_1_transformer_blocks_0_attn1_to_q.lora_down.weight", &[8, 1280]),
        ]);
        assert_eq!(detect_lora(&sdxl, None).unwrap().0, ModelVersion::SdxlBase);

        let te_only = state_dict(&[
            ("lora_te1_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight", &[8, 768]),
            ("lora_te2_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight", &[8, 1280]),
        ]);
        assert_eq!(detect_lora(&te_only, None).unwrap().0, ModelVersion::SdxlBase);

        let v1 = state_dict(&[(
            "lora_te_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight",
            &[4, 768],
        )]);
        assert_eq!(detect_lora(&v1, None).unwrap().0, ModelVersion::V1);
    }

    #[test]
    fn test_lora_dit_fingerprints() {
        let flux = state_dict(&[(
            "lora_unet_single_transformer_blocks_37_attn_to_k.lora_down.weight",
            &[16, 3072],
        )]);
        assert_eq!(detect_lora(&flux, None).unwrap().0, ModelVersion::Flux1);
        assert_eq!(
            detect_lora(&flux, Some(ModelVersion::HunyuanVideo)).unwrap().0,
            ModelVersion::HunyuanVideo
        );

        let sd3 = state_dict(&[(
            "lora_unet_transformer_blocks_22_ff_context_net_0_proj.lora_down.weight",
            &[16, 1536],
        )]);
        assert_eq!(detect_lora(&sd3, None).unwrap().0, ModelVersion::Sd3);

        let wan = state_dict(&[
            ("diffusion_model.blocks.27.cross_attn.k.lora_down.weight", &[16, 5120]),
            ("diffusion_model.blocks.39.cross_attn.v.lora_down.weight", &[16, 5120]),
        ]);
        assert_eq!(detect_lora(&wan, None).unwrap().0, ModelVersion::Wan21_14b);
    }

    #[test]
    fn test_lora_dual_attention_from_modulation_rows() {
        let sd = state_dict(&[
            ("lora_unet_joint_blocks_23_context_block_attn_qkv.lora_down.weight", &[8, 1536]),
            (
                "lora_unet_joint_blocks_0_x_block_adaLN_modulation_1.lora_up.weight",
                &[1536 * 9, 8],
            ),
            (
                "lora_unet_joint_blocks_1_x_block_adaLN_modulation_1.lora_up.weight",
                &[1536 * 6, 8],
            ),
            ("lora_unet_joint_blocks_2_x_block_attn2_qkv.lora_down.weight", &[8, 1536]),
        ]);
        let (version, options) = detect_lora(&sd, None).unwrap();
        assert_eq!(version, ModelVersion::Sd3);
        assert_eq!(options.dual_attention_layers, vec![0, 2]);
    }

    #[test]
    fn test_lora_without_fingerprint_fails() {
        let sd = state_dict(&[("something_else.lora_down.weight", &[4, 4])]);
        assert!(matches!(detect_lora(&sd, None), Err(Error::ModelVersionFailed)));
    }

    #[test]
    fn test_text_encoder_swap() {
        let swapped = state_dict(&[
            ("lora_te1_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight", &[8, 1280]),
            ("lora_te2_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight", &[8, 768]),
        ]);
        assert!(sdxl_text_encoders_swapped(&swapped));
        let regular = state_dict(&[
            ("lora_te1_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight", &[8, 768]),
            ("lora_te2_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight", &[8, 1280]),
        ]);
        assert!(!sdxl_text_encoders_swapped(&regular));
    }

    #[test]
    fn test_controlnet_detection() {
        let sd15 = state_dict(&[(
            "model.control_model.input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight",
            &[320, 768],
        )]);
        let inspection = detect_controlnet(&sd15).unwrap();
        assert_eq!(inspection.version, ModelVersion::V1);
        assert_eq!(inspection.naming, NamingFormat::GenerativeModels);

        let refiner = state_dict(&[("label_emb.0.0.weight", &[1536, 2560])]);
        assert!(matches!(
            detect_controlnet(&refiner),
            Err(Error::UnsupportedModel(_))
        ));

        let small = state_dict(&[
            ("add_embedding.linear_1.weight", &[1280, 2816]),
            ("controlnet_down_blocks.0.weight", &[320, 320, 1, 1]),
            ("down_blocks.1.attentions.0.transformer_blocks.0.attn2.to_k.weight", &[640, 2048]),
            ("down_blocks.2.attentions.0.transformer_blocks.0.attn2.to_k.weight", &[1280, 2048]),
            ("down_blocks.2.attentions.0.transformer_blocks.1.attn2.to_k.weight", &[1280, 2048]),
            ("control_add_embedding.linear_1.weight", &[1280, 256]),
        ]);
        let inspection = detect_controlnet(&small).unwrap();
        assert_eq!(inspection.version, ModelVersion::SdxlBase);
        assert_eq!(inspection.kind, ControlNetKind::ControlNetUnion);
        assert_eq!(
            inspection.layout,
            ControlNetLayout::UNet {
                level1_depth: Some(1),
                level2_depth: Some(2),
                middle_depth: Some(0),
            }
        );
    }

    #[test]
    fn test_flux_controlnet_detection() {
        let sd = state_dict(&[
            ("transformer_blocks.0.attn.to_k.weight", &[3072, 3072]),
            ("transformer_blocks.1.attn.to_k.weight", &[3072, 3072]),
            ("single_transformer_blocks.0.attn.to_k.weight", &[3072, 3072]),
            ("controlnet_mode_embedder.weight", &[10, 3072]),
        ]);
        let inspection = detect_controlnet(&sd).unwrap();
        assert_eq!(inspection.version, ModelVersion::Flux1);
        assert_eq!(inspection.kind, ControlNetKind::ControlNetUnion);
        assert_eq!(inspection.layout, ControlNetLayout::Flux { double: 2, single: 1 });

        let empty = state_dict(&[("foo.weight", &[1])]);
        assert!(matches!(
            detect_controlnet(&empty),
            Err(Error::TensorNotFound { .. })
        ));
    }
}
