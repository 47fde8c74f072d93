//! UNet tables for the Stable Diffusion v1/v2 and SDXL families

use super::{Half, NamingFormat, NetworkMapping, TableBuilder};

/// Norms, convolutions and time projection of a ResNet block without a shortcut.
const RES_BLOCK_TENSORS: usize = 10;

/// Layout of a latent-diffusion UNet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UNetConfig {
    /// Channel width of each resolution level.
    pub channels: Vec<usize>,
    /// Transformer depth of each of the two input blocks per level (empty: none).
    pub input_attention: Vec<Vec<usize>>,
    /// Transformer depth of the middle block (0: no attention).
    pub middle_attention: usize,
    /// Transformer depth of each of the three output blocks per level.
    pub output_attention: Vec<Vec<usize>>,
    /// Width of the cross-attention context.
    pub context_dim: usize,
    /// Input width of the additional (size/crop) embedding, if any.
    pub adm_in_channels: Option<usize>,
    /// Cross-attention key/value projections live in the fixed half.
    pub fixed_cross_attention: bool,
}

impl UNetConfig {
    pub fn v1() -> Self {
        Self {
            channels: vec![320, 640, 1280, 1280],
            input_attention: vec![vec![1, 1], vec![1, 1], vec![1, 1], vec![]],
            middle_attention: 1,
            output_attention: vec![vec![1, 1, 1], vec![1, 1, 1], vec![1, 1, 1], vec![]],
            context_dim: 768,
            adm_in_channels: None,
            fixed_cross_attention: false,
        }
    }

    pub fn v2() -> Self {
        Self {
            context_dim: 1024,
            ..Self::v1()
        }
    }

    pub fn sdxl_base() -> Self {
        Self {
            channels: vec![320, 640, 1280],
            input_attention: vec![vec![], vec![2, 2], vec![10, 10]],
            middle_attention: 10,
            output_attention: vec![vec![], vec![2, 2, 2], vec![10, 10, 10]],
            context_dim: 2048,
            adm_in_channels: Some(2816),
            fixed_cross_attention: true,
        }
    }

    pub fn sdxl_refiner() -> Self {
        Self {
            channels: vec![384, 768, 1536, 1536],
            input_attention: vec![vec![], vec![4, 4], vec![4, 4], vec![]],
            middle_attention: 4,
            output_attention: vec![vec![], vec![4, 4, 4], vec![4, 4, 4], vec![]],
            context_dim: 1280,
            adm_in_channels: Some(2560),
            fixed_cross_attention: true,
        }
    }

    pub fn ssd1b() -> Self {
        Self {
            input_attention: vec![vec![], vec![2, 2], vec![4, 4]],
            middle_attention: 0,
            output_attention: vec![vec![], vec![2, 1, 1], vec![4, 4, 10]],
            ..Self::sdxl_base()
        }
    }

    fn input_depth(&self, level: usize, block: usize) -> usize {
        depth_at(&self.input_attention, level, block)
    }

    fn output_depth(&self, level: usize, block: usize) -> usize {
        depth_at(&self.output_attention, level, block)
    }

    /// Number of `input_blocks` entries, including the input convolution.
    pub fn input_block_count(&self) -> usize {
        3 * self.channels.len()
    }

    /// Number of tensors a complete checkpoint of this layout carries.
    pub fn expected_tensors(&self) -> usize {
        let transformer = |depth: usize| if depth > 0 { 6 + 20 * depth } else { 0 };
        let levels = self.channels.len();
        // time embedding, input convolution, output norm and convolution
        let mut count = 4 + 2 + 4;
        if self.adm_in_channels.is_some() {
            count += 4;
        }
        let mut previous = self.channels.first().copied().unwrap_or_default();
        for (level, &channels) in self.channels.iter().enumerate() {
            for block in 0..2 {
                let skip = if previous != channels { 2 } else { 0 };
                count += RES_BLOCK_TENSORS + skip + transformer(self.input_depth(level, block));
                previous = channels;
            }
            if level + 1 < levels {
                count += 2;
            }
        }
        count += 2 * RES_BLOCK_TENSORS + transformer(self.middle_attention);
        for level in 0..levels {
            for block in 0..3 {
                count += RES_BLOCK_TENSORS + 2 + transformer(self.output_depth(level, block));
            }
            if level > 0 {
                count += 2;
            }
        }
        count
    }

    /// Full UNet table.
    pub fn mapping(&self, naming: NamingFormat) -> NetworkMapping {
        let mut builder = TableBuilder::new(naming, "model.diffusion_model.");
        self.walk_encoder(&mut builder);
        self.walk_decoder(&mut builder);
        builder.finish()
    }

    /// Time embedding, input blocks and middle block only.
    pub(crate) fn walk_encoder(&self, b: &mut TableBuilder) {
        b.linear(Half::Main, "time_embed.0", "time_embedding.linear_1");
        b.linear(Half::Main, "time_embed.2", "time_embedding.linear_2");
        if self.adm_in_channels.is_some() {
            b.linear(Half::Main, "label_emb.0.0", "add_embedding.linear_1");
            b.linear(Half::Main, "label_emb.0.2", "add_embedding.linear_2");
        }
        b.linear(Half::Main, "input_blocks.0.0", "conv_in");

        let levels = self.channels.len();
        let mut index = 1;
        let mut previous = self.channels[0];
        for (level, &channels) in self.channels.iter().enumerate() {
            for block in 0..2 {
                let diffusers = format!("down_blocks.{level}");
                res_block(
                    b,
                    &format!("input_blocks.{index}.0"),
                    &format!("{diffusers}.resnets.{block}"),
                    previous != channels,
                );
                previous = channels;
                let depth = self.input_depth(level, block);
                if depth > 0 {
                    self.transformer(
                        b,
                        &format!("input_blocks.{index}.1"),
                        &format!("{diffusers}.attentions.{block}"),
                        depth,
                    );
                }
                index += 1;
            }
            if level + 1 < levels {
                b.linear(
                    Half::Main,
                    &format!("input_blocks.{index}.0.op"),
                    &format!("down_blocks.{level}.downsamplers.0.conv"),
                );
                index += 1;
            }
        }

        res_block(b, "middle_block.0", "mid_block.resnets.0", false);
        if self.middle_attention > 0 {
            self.transformer(b, "middle_block.1", "mid_block.attentions.0", self.middle_attention);
            res_block(b, "middle_block.2", "mid_block.resnets.1", false);
        } else {
            res_block(b, "middle_block.1", "mid_block.resnets.1", false);
        }
    }

    fn walk_decoder(&self, b: &mut TableBuilder) {
        let levels = self.channels.len();
        let mut index = 0;
        for level in (0..levels).rev() {
            let up = levels - 1 - level;
            for block in 0..3 {
                let diffusers = format!("up_blocks.{up}");
                res_block(
                    b,
                    &format!("output_blocks.{index}.0"),
                    &format!("{diffusers}.resnets.{block}"),
                    true,
                );
                let depth = self.output_depth(level, block);
                if depth > 0 {
                    self.transformer(
                        b,
                        &format!("output_blocks.{index}.1"),
                        &format!("{diffusers}.attentions.{block}"),
                        depth,
                    );
                }
                if level > 0 && block == 2 {
                    let slot = if depth > 0 { 2 } else { 1 };
                    b.linear(
                        Half::Main,
                        &format!("output_blocks.{index}.{slot}.conv"),
                        &format!("{diffusers}.upsamplers.0.conv"),
                    );
                }
                index += 1;
            }
        }
        b.linear(Half::Main, "out.0", "conv_norm_out");
        b.linear(Half::Main, "out.2", "conv_out");
    }

    fn transformer(&self, b: &mut TableBuilder, generative: &str, diffusers: &str, depth: usize) {
        b.linear(Half::Main, &format!("{generative}.norm"), &format!("{diffusers}.norm"));
        b.linear(Half::Main, &format!("{generative}.proj_in"), &format!("{diffusers}.proj_in"));
        let kv_half = if self.fixed_cross_attention {
            Half::Fixed
        } else {
            Half::Main
        };
        for t in 0..depth {
            let g = format!("{generative}.transformer_blocks.{t}");
            let d = format!("{diffusers}.transformer_blocks.{t}");
            for proj in ["to_q", "to_k", "to_v"] {
                b.weight(Half::Main, &format!("{g}.attn1.{proj}"), &format!("{d}.attn1.{proj}"));
            }
            b.linear(Half::Main, &format!("{g}.attn1.to_out.0"), &format!("{d}.attn1.to_out.0"));
            b.weight(Half::Main, &format!("{g}.attn2.to_q"), &format!("{d}.attn2.to_q"));
            b.weight(kv_half, &format!("{g}.attn2.to_k"), &format!("{d}.attn2.to_k"));
            b.weight(kv_half, &format!("{g}.attn2.to_v"), &format!("{d}.attn2.to_v"));
            b.linear(Half::Main, &format!("{g}.attn2.to_out.0"), &format!("{d}.attn2.to_out.0"));
            b.linear(Half::Main, &format!("{g}.ff.net.0.proj"), &format!("{d}.ff.net.0.proj"));
            b.linear(Half::Main, &format!("{g}.ff.net.2"), &format!("{d}.ff.net.2"));
            for norm in ["norm1", "norm2", "norm3"] {
                b.linear(Half::Main, &format!("{g}.{norm}"), &format!("{d}.{norm}"));
            }
        }
        b.linear(Half::Main, &format!("{generative}.proj_out"), &format!("{diffusers}.proj_out"));
    }
}

fn depth_at(table: &[Vec<usize>], level: usize, block: usize) -> usize {
    table
        .get(level)
        .and_then(|blocks| blocks.get(block))
        .copied()
        .unwrap_or(0)
}

/// ResNet block: GenerativeModels `in_layers`/`out_layers` vs Diffusers `norm1`/`conv1`.
fn res_block(b: &mut TableBuilder, generative: &str, diffusers: &str, skip: bool) {
    let pairs = [
        ("in_layers.0", "norm1"),
        ("in_layers.2", "conv1"),
        ("emb_layers.1", "time_emb_proj"),
        ("out_layers.0", "norm2"),
        ("out_layers.3", "conv2"),
    ];
    for (g, d) in pairs {
        b.linear(Half::Main, &format!("{generative}.{g}"), &format!("{diffusers}.{d}"));
    }
    if skip {
        b.linear(
            Half::Main,
            &format!("{generative}.skip_connection"),
            &format!("{diffusers}.conv_shortcut"),
        );
    }
}
