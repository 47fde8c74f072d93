//! Stable Diffusion 3 (MMDiT) tables

use super::{Half, NamingFormat, NetworkMapping, SplitFormat, TableBuilder};

/// Layout of a multi-modal diffusion transformer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MMDiTConfig {
    pub hidden_size: usize,
    pub layers: usize,
    /// RMS normalization of queries and keys.
    pub qk_norm: bool,
    /// Blocks carrying a second self-attention over the image stream.
    pub dual_attention_layers: Vec<usize>,
}

impl MMDiTConfig {
    pub fn sd3_medium() -> Self {
        Self {
            hidden_size: 1536,
            layers: 24,
            qk_norm: false,
            dual_attention_layers: Vec::new(),
        }
    }

    pub fn sd3_large() -> Self {
        Self {
            hidden_size: 2432,
            layers: 38,
            qk_norm: true,
            dual_attention_layers: Vec::new(),
        }
    }

    /// Number of tensors a complete checkpoint of this layout carries.
    pub fn expected_tensors(&self) -> usize {
        let attention = 8 + if self.qk_norm { 2 } else { 0 };
        let block = 2 + attention + 4 + 2 + attention + 4;
        let dual = (0..self.layers)
            .filter(|i| self.dual_attention_layers.contains(i))
            .count();
        // The last context block has no output projection and no MLP.
        16 + self.layers * block + dual * attention - self.layers.min(1) * 6
    }

    pub fn mapping(&self, naming: NamingFormat) -> NetworkMapping {
        let mut b = TableBuilder::new(naming, "model.diffusion_model.");
        b.linear(Half::Main, "x_embedder.proj", "pos_embed.proj");
        b.linear(Half::Fixed, "t_embedder.mlp.0", "time_text_embed.timestep_embedder.linear_1");
        b.linear(Half::Fixed, "t_embedder.mlp.2", "time_text_embed.timestep_embedder.linear_2");
        b.linear(Half::Fixed, "y_embedder.mlp.0", "time_text_embed.text_embedder.linear_1");
        b.linear(Half::Fixed, "y_embedder.mlp.2", "time_text_embed.text_embedder.linear_2");
        b.linear(Half::Fixed, "context_embedder", "context_embedder");

        for i in 0..self.layers {
            let last = i + 1 == self.layers;
            let g = format!("joint_blocks.{i}");
            let d = format!("transformer_blocks.{i}");

            b.linear(
                Half::Fixed,
                &format!("{g}.x_block.adaLN_modulation.1"),
                &format!("{d}.norm1.linear"),
            );
            self.attention(&mut b, &format!("{g}.x_block.attn"), &format!("{d}.attn"), false, true);
            b.linear(Half::Main, &format!("{g}.x_block.mlp.fc1"), &format!("{d}.ff.net.0.proj"));
            b.linear(Half::Main, &format!("{g}.x_block.mlp.fc2"), &format!("{d}.ff.net.2"));
            if self.dual_attention_layers.contains(&i) {
                self.attention(&mut b, &format!("{g}.x_block.attn2"), &format!("{d}.attn2"), false, true);
            }

            b.linear(
                Half::Fixed,
                &format!("{g}.context_block.adaLN_modulation.1"),
                &format!("{d}.norm1_context.linear"),
            );
            // The last context block only feeds keys and values to the image stream.
            self.attention(&mut b, &format!("{g}.context_block.attn"), &format!("{d}.attn"), true, !last);
            if !last {
                b.linear(
                    Half::Main,
                    &format!("{g}.context_block.mlp.fc1"),
                    &format!("{d}.ff_context.net.0.proj"),
                );
                b.linear(
                    Half::Main,
                    &format!("{g}.context_block.mlp.fc2"),
                    &format!("{d}.ff_context.net.2"),
                );
            }
        }

        b.linear(Half::Fixed, "final_layer.adaLN_modulation.1", "norm_out.linear");
        b.linear(Half::Main, "final_layer.linear", "proj_out");
        b.finish()
    }

    fn attention(&self, b: &mut TableBuilder, g: &str, d: &str, context: bool, projection: bool) {
        let (diffusers, out, norms) = if context {
            (
                [
                    format!("{d}.add_q_proj"),
                    format!("{d}.add_k_proj"),
                    format!("{d}.add_v_proj"),
                ],
                format!("{d}.to_add_out"),
                [format!("{d}.norm_added_q"), format!("{d}.norm_added_k")],
            )
        } else {
            (
                [format!("{d}.to_q"), format!("{d}.to_k"), format!("{d}.to_v")],
                format!("{d}.to_out.0"),
                [format!("{d}.norm_q"), format!("{d}.norm_k")],
            )
        };
        let diffusers: Vec<&str> = diffusers.iter().map(String::as_str).collect();
        b.fused(
            Half::Main,
            &format!("{g}.qkv"),
            &["q", "k", "v"],
            &diffusers,
            SplitFormat::O,
            None,
            true,
        );
        if projection {
            b.linear(Half::Main, &format!("{g}.proj"), &out);
        }
        if self.qk_norm {
            b.weight(Half::Main, &format!("{g}.ln_q"), &norms[0]);
            b.weight(Half::Main, &format!("{g}.ln_k"), &norms[1]);
        }
    }
}
