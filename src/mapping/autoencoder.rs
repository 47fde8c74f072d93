//! KL autoencoder (VAE) tables

use super::{Half, ModelWeightMapping, NamingFormat, TableBuilder};
use crate::version::ModelVersion;

/// Norms and convolutions of a VAE ResNet block without a shortcut.
const RES_BLOCK_TENSORS: usize = 8;
/// Middle block: two ResNet blocks around one attention block.
const MID_BLOCK_TENSORS: usize = 2 * RES_BLOCK_TENSORS + 10;

/// Layout of a latent-diffusion KL autoencoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoencoderConfig {
    /// Channel width of each resolution level.
    pub channels: Vec<usize>,
    /// ResNet blocks per encoder level; decoder levels carry one more.
    pub res_blocks: usize,
    /// `quant_conv`/`post_quant_conv` around the latent.
    pub quant_conv: bool,
}

impl AutoencoderConfig {
    /// The 4-channel VAE of Stable Diffusion v1/v2 and SDXL.
    pub fn kl_f8() -> Self {
        Self {
            channels: vec![128, 256, 512, 512],
            res_blocks: 2,
            quant_conv: true,
        }
    }

    /// The 16-channel VAE of Stable Diffusion 3.
    pub fn kl_f8_16ch() -> Self {
        Self {
            quant_conv: false,
            ..Self::kl_f8()
        }
    }

    /// Autoencoder bundled in single-file checkpoints of `version`.
    pub fn for_version(version: ModelVersion) -> Option<Self> {
        match version {
            _ if version.is_unet_family() => Some(Self::kl_f8()),
            ModelVersion::Sd3 | ModelVersion::Sd3Large => Some(Self::kl_f8_16ch()),
            _ => None,
        }
    }

    pub fn encoder_tensors(&self) -> usize {
        let levels = self.channels.len();
        let mut count = 2 + MID_BLOCK_TENSORS + 4;
        let mut previous = self.channels.first().copied().unwrap_or_default();
        for (level, &channels) in self.channels.iter().enumerate() {
            count += self.res_blocks * RES_BLOCK_TENSORS;
            if previous != channels {
                count += 2;
            }
            if level + 1 < levels {
                count += 2;
            }
            previous = channels;
        }
        if self.quant_conv {
            count += 2;
        }
        count
    }

    pub fn decoder_tensors(&self) -> usize {
        let mut count = 2 + MID_BLOCK_TENSORS + 4;
        let mut previous = self.channels.last().copied().unwrap_or_default();
        for (level, &channels) in self.channels.iter().enumerate().rev() {
            count += (self.res_blocks + 1) * RES_BLOCK_TENSORS;
            if previous != channels {
                count += 2;
            }
            if level > 0 {
                count += 2;
            }
            previous = channels;
        }
        if self.quant_conv {
            count += 2;
        }
        count
    }

    /// Encoder table, `quant_conv` included.
    pub fn encoder_mapping(&self, naming: NamingFormat) -> ModelWeightMapping {
        let mut b = TableBuilder::new(naming, "first_stage_model.");
        b.linear(Half::Main, "encoder.conv_in", "encoder.conv_in");
        let levels = self.channels.len();
        let mut previous = self.channels.first().copied().unwrap_or_default();
        for (level, &channels) in self.channels.iter().enumerate() {
            for block in 0..self.res_blocks {
                res_block(
                    &mut b,
                    &format!("encoder.down.{level}.block.{block}"),
                    &format!("encoder.down_blocks.{level}.resnets.{block}"),
                    previous != channels,
                );
                previous = channels;
            }
            if level + 1 < levels {
                b.linear(
                    Half::Main,
                    &format!("encoder.down.{level}.downsample.conv"),
                    &format!("encoder.down_blocks.{level}.downsamplers.0.conv"),
                );
            }
        }
        mid_block(&mut b, "encoder");
        b.linear(Half::Main, "encoder.norm_out", "encoder.conv_norm_out");
        b.linear(Half::Main, "encoder.conv_out", "encoder.conv_out");
        if self.quant_conv {
            b.linear(Half::Main, "quant_conv", "quant_conv");
        }
        b.finish().main
    }

    /// Decoder table, `post_quant_conv` included.
    pub fn decoder_mapping(&self, naming: NamingFormat) -> ModelWeightMapping {
        let mut b = TableBuilder::new(naming, "first_stage_model.");
        if self.quant_conv {
            b.linear(Half::Main, "post_quant_conv", "post_quant_conv");
        }
        b.linear(Half::Main, "decoder.conv_in", "decoder.conv_in");
        mid_block(&mut b, "decoder");
        let levels = self.channels.len();
        let mut previous = self.channels.last().copied().unwrap_or_default();
        for (level, &channels) in self.channels.iter().enumerate().rev() {
            let up = levels - 1 - level;
            for block in 0..=self.res_blocks {
                res_block(
                    &mut b,
                    &format!("decoder.up.{level}.block.{block}"),
                    &format!("decoder.up_blocks.{up}.resnets.{block}"),
                    previous != channels,
                );
                previous = channels;
            }
            if level > 0 {
                b.linear(
                    Half::Main,
                    &format!("decoder.up.{level}.upsample.conv"),
                    &format!("decoder.up_blocks.{up}.upsamplers.0.conv"),
                );
            }
        }
        b.linear(Half::Main, "decoder.norm_out", "decoder.conv_norm_out");
        b.linear(Half::Main, "decoder.conv_out", "decoder.conv_out");
        b.finish().main
    }
}

fn res_block(b: &mut TableBuilder, generative: &str, diffusers: &str, shortcut: bool) {
    for name in ["norm1", "conv1", "norm2", "conv2"] {
        b.linear(Half::Main, &format!("{generative}.{name}"), &format!("{diffusers}.{name}"));
    }
    if shortcut {
        b.linear(
            Half::Main,
            &format!("{generative}.nin_shortcut"),
            &format!("{diffusers}.conv_shortcut"),
        );
    }
}

fn mid_block(b: &mut TableBuilder, side: &str) {
    res_block(b, &format!("{side}.mid.block_1"), &format!("{side}.mid_block.resnets.0"), false);
    for (g, d) in [
        ("norm", "group_norm"),
        ("q", "to_q"),
        ("k", "to_k"),
        ("v", "to_v"),
        ("proj_out", "to_out.0"),
    ] {
        b.linear(
            Half::Main,
            &format!("{side}.mid.attn_1.{g}"),
            &format!("{side}.mid_block.attentions.0.{d}"),
        );
    }
    res_block(b, &format!("{side}.mid.block_2"), &format!("{side}.mid_block.resnets.1"), false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::canonical_names;

    #[test]
    fn test_kl_f8_counts_match_tables() {
        for config in [AutoencoderConfig::kl_f8(), AutoencoderConfig::kl_f8_16ch()] {
            for naming in [NamingFormat::GenerativeModels, NamingFormat::Diffusers] {
                assert_eq!(
                    canonical_names(&config.encoder_mapping(naming)).len(),
                    config.encoder_tensors()
                );
                assert_eq!(
                    canonical_names(&config.decoder_mapping(naming)).len(),
                    config.decoder_tensors()
                );
            }
        }
        assert_eq!(AutoencoderConfig::kl_f8().encoder_tensors(), 108);
        assert_eq!(AutoencoderConfig::kl_f8().decoder_tensors(), 140);
    }

    #[test]
    fn test_decoder_levels_reverse_in_diffusers() {
        let mapping = AutoencoderConfig::kl_f8().decoder_mapping(NamingFormat::Diffusers);
        assert_eq!(
            mapping["decoder.up_blocks.3.resnets.0.conv_shortcut.weight"].names,
            vec!["decoder.up.0.block.0.nin_shortcut.weight"]
        );
        let generative = AutoencoderConfig::kl_f8().encoder_mapping(NamingFormat::GenerativeModels);
        assert!(generative.contains_key("first_stage_model.encoder.mid.attn_1.proj_out.weight"));
        assert!(generative.contains_key("first_stage_model.quant_conv.bias"));
    }
}
