//! Supported model architectures and sampler modifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Architecture version a checkpoint targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVersion {
    V1,
    V2,
    SdxlBase,
    SdxlRefiner,
    Ssd1b,
    Sd3,
    Sd3Large,
    Pixart,
    Auraflow,
    Flux1,
    HunyuanVideo,
    #[serde(rename = "wan21_1_3b")]
    Wan21_1_3b,
    #[serde(rename = "wan21_14b")]
    Wan21_14b,
}

impl ModelVersion {
    pub const ALL: [ModelVersion; 13] = [
        ModelVersion::V1,
        ModelVersion::V2,
        ModelVersion::SdxlBase,
        ModelVersion::SdxlRefiner,
        ModelVersion::Ssd1b,
        ModelVersion::Sd3,
        ModelVersion::Sd3Large,
        ModelVersion::Pixart,
        ModelVersion::Auraflow,
        ModelVersion::Flux1,
        ModelVersion::HunyuanVideo,
        ModelVersion::Wan21_1_3b,
        ModelVersion::Wan21_14b,
    ];

    /// Stable identifier used in configs and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelVersion::V1 => "v1",
            ModelVersion::V2 => "v2",
            ModelVersion::SdxlBase => "sdxl_base",
            ModelVersion::SdxlRefiner => "sdxl_refiner",
            ModelVersion::Ssd1b => "ssd1b",
            ModelVersion::Sd3 => "sd3",
            ModelVersion::Sd3Large => "sd3_large",
            ModelVersion::Pixart => "pixart",
            ModelVersion::Auraflow => "auraflow",
            ModelVersion::Flux1 => "flux1",
            ModelVersion::HunyuanVideo => "hunyuan_video",
            ModelVersion::Wan21_1_3b => "wan21_1_3b",
            ModelVersion::Wan21_14b => "wan21_14b",
        }
    }

    /// `ss_base_model_version` tag written into exported adapters.
    pub fn export_tag(self) -> &'static str {
        match self {
            ModelVersion::V1 => "sd_v1",
            ModelVersion::V2 => "sd_v2",
            ModelVersion::SdxlBase => "sdxl_base",
            ModelVersion::SdxlRefiner => "sdxl_refiner",
            ModelVersion::Ssd1b => "ssd_1b",
            ModelVersion::Sd3 => "sd3_medium",
            ModelVersion::Sd3Large => "sd3_large",
            ModelVersion::Pixart => "pixart",
            ModelVersion::Auraflow => "auraflow_v0.2",
            ModelVersion::Flux1 => "flux_1",
            ModelVersion::HunyuanVideo => "hunyuan_video",
            ModelVersion::Wan21_1_3b => "wan_v2.1_1.3b",
            ModelVersion::Wan21_14b => "wan_v2.1_14b",
        }
    }

    /// Inverse of [`ModelVersion::export_tag`].
    pub fn from_export_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.export_tag() == tag)
    }

    /// SDXL base, refiner and SSD-1B share the SDXL UNet layout.
    pub fn is_sdxl_family(self) -> bool {
        matches!(
            self,
            ModelVersion::SdxlBase | ModelVersion::SdxlRefiner | ModelVersion::Ssd1b
        )
    }

    /// Versions whose denoiser is a UNet rather than a diffusion transformer.
    pub fn is_unet_family(self) -> bool {
        matches!(self, ModelVersion::V1 | ModelVersion::V2) || self.is_sdxl_family()
    }

    /// Store prefixes of the main network and its fixed half.
    pub fn network_prefixes(self) -> (&'static str, &'static str) {
        if self.is_unet_family() {
            ("unet", "unet_fixed")
        } else {
            ("dit", "dit")
        }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == lowered || v.export_tag() == lowered)
            .ok_or_else(|| format!("unknown model version '{s}'"))
    }
}

/// Conditioning variant a full model was trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerModifier {
    #[default]
    None,
    Inpainting,
    Editing,
    Depth,
}

impl SamplerModifier {
    /// Modifier implied by the channel count of a UNet input convolution.
    pub fn from_input_channels(channels: usize) -> Self {
        match channels {
            9 => SamplerModifier::Inpainting,
            8 => SamplerModifier::Editing,
            5 => SamplerModifier::Depth,
            _ => SamplerModifier::None,
        }
    }
}
