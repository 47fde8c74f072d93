//! PixArt-Sigma tables

use super::{Half, NamingFormat, NetworkMapping, SplitFormat, TableBuilder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixArtConfig {
    pub hidden_size: usize,
    pub layers: usize,
}

impl PixArtConfig {
    pub fn sigma_xl() -> Self {
        Self {
            hidden_size: 1152,
            layers: 28,
        }
    }

    pub fn expected_tensors(&self) -> usize {
        15 + 21 * self.layers
    }

    pub fn mapping(&self, naming: NamingFormat) -> NetworkMapping {
        let mut b = TableBuilder::new(naming, "");
        b.linear(Half::Main, "x_embedder.proj", "pos_embed.proj");
        b.linear(Half::Fixed, "t_embedder.mlp.0", "adaln_single.emb.timestep_embedder.linear_1");
        b.linear(Half::Fixed, "t_embedder.mlp.2", "adaln_single.emb.timestep_embedder.linear_2");
        b.linear(Half::Fixed, "t_block.1", "adaln_single.linear");
        b.linear(Half::Fixed, "y_embedder.y_proj.fc1", "caption_projection.linear_1");
        b.linear(Half::Fixed, "y_embedder.y_proj.fc2", "caption_projection.linear_2");

        for i in 0..self.layers {
            let g = format!("blocks.{i}");
            let d = format!("transformer_blocks.{i}");
            b.raw(
                Half::Main,
                &format!("{g}.scale_shift_table"),
                &format!("{d}.scale_shift_table"),
            );
            let to_qkv = [
                format!("{d}.attn1.to_q"),
                format!("{d}.attn1.to_k"),
                format!("{d}.attn1.to_v"),
            ];
            let to_qkv: Vec<&str> = to_qkv.iter().map(String::as_str).collect();
            b.fused(
                Half::Main,
                &format!("{g}.attn.qkv"),
                &["q", "k", "v"],
                &to_qkv,
                SplitFormat::O,
                None,
                true,
            );
            b.linear(Half::Main, &format!("{g}.attn.proj"), &format!("{d}.attn1.to_out.0"));
            b.linear(Half::Main, &format!("{g}.cross_attn.q_linear"), &format!("{d}.attn2.to_q"));
            let to_kv = [format!("{d}.attn2.to_k"), format!("{d}.attn2.to_v")];
            let to_kv: Vec<&str> = to_kv.iter().map(String::as_str).collect();
            b.fused(
                Half::Fixed,
                &format!("{g}.cross_attn.kv_linear"),
                &["k_linear", "v_linear"],
                &to_kv,
                SplitFormat::O,
                None,
                true,
            );
            b.linear(Half::Main, &format!("{g}.cross_attn.proj"), &format!("{d}.attn2.to_out.0"));
            b.linear(Half::Main, &format!("{g}.mlp.fc1"), &format!("{d}.ff.net.0.proj"));
            b.linear(Half::Main, &format!("{g}.mlp.fc2"), &format!("{d}.ff.net.2"));
        }

        b.raw(Half::Main, "final_layer.scale_shift_table", "scale_shift_table");
        b.linear(Half::Main, "final_layer.linear", "proj_out");
        b.finish()
    }
}
