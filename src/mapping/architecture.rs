//! Closed set of denoiser architectures keyed by [`ModelVersion`]

use super::{
    text_encoders, AuraFlowConfig, FluxConfig, HunyuanConfig, MMDiTConfig, NamingFormat,
    NetworkMapping, PixArtConfig, TextEncoderConfig, UNetConfig, WanConfig,
};
use crate::version::ModelVersion;

/// Variant flags read from a checkpoint that change the table layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingOptions {
    /// SD3 query/key RMS norms.
    pub qk_norm: bool,
    /// SD3 blocks with a second image self-attention.
    pub dual_attention_layers: Vec<usize>,
    /// Wan image-to-video projections.
    pub image_conditioning: bool,
    /// FLUX.1 guidance embedder present.
    pub guidance_embed: bool,
}

/// Data-only description of a denoising network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchitectureSpec {
    UNet(UNetConfig),
    MMDiT(MMDiTConfig),
    PixArt(PixArtConfig),
    AuraFlow(AuraFlowConfig),
    Flux(FluxConfig),
    Hunyuan(HunyuanConfig),
    Wan(WanConfig),
}

impl ArchitectureSpec {
    pub fn for_version(version: ModelVersion, options: &MappingOptions) -> Self {
        match version {
            ModelVersion::V1 => ArchitectureSpec::UNet(UNetConfig::v1()),
            ModelVersion::V2 => ArchitectureSpec::UNet(UNetConfig::v2()),
            ModelVersion::SdxlBase => ArchitectureSpec::UNet(UNetConfig::sdxl_base()),
            ModelVersion::SdxlRefiner => ArchitectureSpec::UNet(UNetConfig::sdxl_refiner()),
            ModelVersion::Ssd1b => ArchitectureSpec::UNet(UNetConfig::ssd1b()),
            ModelVersion::Sd3 | ModelVersion::Sd3Large => {
                let base = if version == ModelVersion::Sd3Large {
                    MMDiTConfig::sd3_large()
                } else {
                    MMDiTConfig::sd3_medium()
                };
                ArchitectureSpec::MMDiT(MMDiTConfig {
                    qk_norm: base.qk_norm || options.qk_norm,
                    dual_attention_layers: options.dual_attention_layers.clone(),
                    ..base
                })
            }
            ModelVersion::Pixart => ArchitectureSpec::PixArt(PixArtConfig::sigma_xl()),
            ModelVersion::Auraflow => ArchitectureSpec::AuraFlow(AuraFlowConfig::v0_2()),
            ModelVersion::Flux1 => ArchitectureSpec::Flux(FluxConfig {
                guidance_embed: options.guidance_embed,
                ..FluxConfig::dev()
            }),
            ModelVersion::HunyuanVideo => ArchitectureSpec::Hunyuan(HunyuanConfig::video()),
            ModelVersion::Wan21_1_3b | ModelVersion::Wan21_14b => {
                let base = if version == ModelVersion::Wan21_14b {
                    WanConfig::t2v_14b()
                } else {
                    WanConfig::t2v_1_3b()
                };
                ArchitectureSpec::Wan(WanConfig {
                    image_conditioning: options.image_conditioning,
                    ..base
                })
            }
        }
    }

    /// Main and fixed tables for `naming`.
    pub fn network_mapping(&self, naming: NamingFormat) -> NetworkMapping {
        match self {
            ArchitectureSpec::UNet(config) => config.mapping(naming),
            ArchitectureSpec::MMDiT(config) => config.mapping(naming),
            ArchitectureSpec::PixArt(config) => config.mapping(naming),
            ArchitectureSpec::AuraFlow(config) => config.mapping(naming),
            ArchitectureSpec::Flux(config) => config.mapping(naming),
            ArchitectureSpec::Hunyuan(config) => config.mapping(naming),
            ArchitectureSpec::Wan(config) => config.mapping(naming),
        }
    }

    /// Tensors a complete checkpoint stores, from the config alone.
    pub fn expected_tensors(&self) -> usize {
        match self {
            ArchitectureSpec::UNet(config) => config.expected_tensors(),
            ArchitectureSpec::MMDiT(config) => config.expected_tensors(),
            ArchitectureSpec::PixArt(config) => config.expected_tensors(),
            ArchitectureSpec::AuraFlow(config) => config.expected_tensors(),
            ArchitectureSpec::Flux(config) => config.expected_tensors(),
            ArchitectureSpec::Hunyuan(config) => config.expected_tensors(),
            ArchitectureSpec::Wan(config) => config.expected_tensors(),
        }
    }

    /// Both dialects merged, GenerativeModels entries first.
    pub fn combined_mapping(&self) -> NetworkMapping {
        let mut mapping = self.network_mapping(NamingFormat::GenerativeModels);
        mapping.merge(self.network_mapping(NamingFormat::Diffusers));
        mapping
    }

    pub fn is_unet(&self) -> bool {
        matches!(self, ArchitectureSpec::UNet(_))
    }

    /// Text encoders with importable adapter weights.
    pub fn text_encoders(
        version: ModelVersion,
    ) -> (Option<TextEncoderConfig>, Option<TextEncoderConfig>) {
        text_encoders(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_version_has_a_table() {
        let options = MappingOptions::default();
        for version in ModelVersion::ALL {
            let spec = ArchitectureSpec::for_version(version, &options);
            assert_eq!(spec.is_unet(), version.is_unet_family(), "{version}");
            let mapping = spec.network_mapping(NamingFormat::GenerativeModels);
            assert!(!mapping.main.is_empty(), "{version}");
        }
    }

    #[test]
    fn test_expected_tensors_match_tables() {
        let variants = [
            MappingOptions::default(),
            MappingOptions {
                qk_norm: true,
                dual_attention_layers: vec![0, 3, 12],
                image_conditioning: true,
                guidance_embed: true,
            },
        ];
        for options in &variants {
            for version in ModelVersion::ALL {
                let spec = ArchitectureSpec::for_version(version, options);
                for naming in [NamingFormat::GenerativeModels, NamingFormat::Diffusers] {
                    let names = spec.network_mapping(naming).canonical_names();
                    assert_eq!(spec.expected_tensors(), names.len(), "{version} {naming:?}");
                }
            }
        }
    }

    #[test]
    fn test_options_reach_configs() {
        let options = MappingOptions {
            qk_norm: true,
            dual_attention_layers: vec![0, 1],
            image_conditioning: true,
            guidance_embed: false,
        };
        match ArchitectureSpec::for_version(ModelVersion::Sd3, &options) {
            ArchitectureSpec::MMDiT(config) => {
                assert!(config.qk_norm);
                assert_eq!(config.dual_attention_layers, vec![0, 1]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match ArchitectureSpec::for_version(ModelVersion::Wan21_14b, &options) {
            ArchitectureSpec::Wan(config) => assert!(config.image_conditioning),
            other => panic!("unexpected {other:?}"),
        }
        match ArchitectureSpec::for_version(ModelVersion::Flux1, &options) {
            ArchitectureSpec::Flux(config) => assert!(!config.guidance_embed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_combined_mapping_accepts_both_dialects() {
        let spec = ArchitectureSpec::for_version(ModelVersion::V1, &MappingOptions::default());
        let mapping = spec.combined_mapping();
        assert!(mapping.main.contains_key("model.diffusion_model.input_blocks.0.0.weight"));
        assert!(mapping.main.contains_key("conv_in.weight"));
        assert_eq!(
            mapping.canonical_names(),
            spec.network_mapping(NamingFormat::Diffusers).canonical_names()
        );
    }
}
