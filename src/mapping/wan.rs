//! Wan 2.1 video transformer tables

use super::{Half, NamingFormat, NetworkMapping, TableBuilder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WanConfig {
    pub hidden_size: usize,
    pub layers: usize,
    pub ffn_size: usize,
    /// Image-to-video checkpoints add image cross-attention projections.
    pub image_conditioning: bool,
}

impl WanConfig {
    pub fn t2v_1_3b() -> Self {
        Self {
            hidden_size: 1536,
            layers: 30,
            ffn_size: 8960,
            image_conditioning: false,
        }
    }

    pub fn t2v_14b() -> Self {
        Self {
            hidden_size: 5120,
            layers: 40,
            ffn_size: 13824,
            image_conditioning: false,
        }
    }

    /// Number of tensors a complete checkpoint of this layout carries.
    pub fn expected_tensors(&self) -> usize {
        let image = if self.image_conditioning {
            8 + 5 * self.layers
        } else {
            0
        };
        15 + 27 * self.layers + image
    }

    pub fn mapping(&self, naming: NamingFormat) -> NetworkMapping {
        let mut b = TableBuilder::new(naming, "");
        b.linear(Half::Main, "patch_embedding", "patch_embedding");
        b.linear(Half::Fixed, "text_embedding.0", "condition_embedder.text_embedder.linear_1");
        b.linear(Half::Fixed, "text_embedding.2", "condition_embedder.text_embedder.linear_2");
        b.linear(Half::Fixed, "time_embedding.0", "condition_embedder.time_embedder.linear_1");
        b.linear(Half::Fixed, "time_embedding.2", "condition_embedder.time_embedder.linear_2");
        b.linear(Half::Fixed, "time_projection.1", "condition_embedder.time_proj");
        if self.image_conditioning {
            for (g, d) in [
                ("img_emb.proj.0", "condition_embedder.image_embedder.norm1"),
                ("img_emb.proj.1", "condition_embedder.image_embedder.ff.net.0.proj"),
                ("img_emb.proj.3", "condition_embedder.image_embedder.ff.net.2"),
                ("img_emb.proj.4", "condition_embedder.image_embedder.norm2"),
            ] {
                b.linear(Half::Fixed, g, d);
            }
        }

        for i in 0..self.layers {
            let g = format!("blocks.{i}");
            let d = format!("blocks.{i}");
            b.raw(Half::Main, &format!("{g}.modulation"), &format!("{d}.scale_shift_table"));
            for (gp, dp) in [
                ("self_attn.q", "attn1.to_q"),
                ("self_attn.k", "attn1.to_k"),
                ("self_attn.v", "attn1.to_v"),
                ("self_attn.o", "attn1.to_out.0"),
                ("cross_attn.q", "attn2.to_q"),
                ("cross_attn.o", "attn2.to_out.0"),
                ("norm3", "norm2"),
                ("ffn.0", "ffn.net.0.proj"),
                ("ffn.2", "ffn.net.2"),
            ] {
                b.linear(Half::Main, &format!("{g}.{gp}"), &format!("{d}.{dp}"));
            }
            for (gp, dp) in [
                ("self_attn.norm_q", "attn1.norm_q"),
                ("self_attn.norm_k", "attn1.norm_k"),
                ("cross_attn.norm_q", "attn2.norm_q"),
                ("cross_attn.norm_k", "attn2.norm_k"),
            ] {
                b.weight(Half::Main, &format!("{g}.{gp}"), &format!("{d}.{dp}"));
            }
            b.linear(Half::Fixed, &format!("{g}.cross_attn.k"), &format!("{d}.attn2.to_k"));
            b.linear(Half::Fixed, &format!("{g}.cross_attn.v"), &format!("{d}.attn2.to_v"));
            if self.image_conditioning {
                b.linear(Half::Fixed, &format!("{g}.cross_attn.k_img"), &format!("{d}.attn2.add_k_proj"));
                b.linear(Half::Fixed, &format!("{g}.cross_attn.v_img"), &format!("{d}.attn2.add_v_proj"));
                b.weight(
                    Half::Main,
                    &format!("{g}.cross_attn.norm_k_img"),
                    &format!("{d}.attn2.norm_added_k"),
                );
            }
        }

        b.raw(Half::Main, "head.modulation", "scale_shift_table");
        b.linear(Half::Main, "head.head", "proj_out");
        b.finish()
    }
}
