//! HunyuanVideo tables

use super::{Half, NamingFormat, NetworkMapping, SplitFormat, TableBuilder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunyuanConfig {
    pub hidden_size: usize,
    pub double_layers: usize,
    pub single_layers: usize,
    /// Blocks of the text token refiner.
    pub refiner_layers: usize,
}

impl HunyuanConfig {
    pub fn video() -> Self {
        Self {
            hidden_size: 3072,
            double_layers: 20,
            single_layers: 40,
            refiner_layers: 2,
        }
    }

    pub fn expected_tensors(&self) -> usize {
        28 + 18 * self.refiner_layers + 32 * self.double_layers + 15 * self.single_layers
    }

    pub fn mapping(&self, naming: NamingFormat) -> NetworkMapping {
        let mut b = TableBuilder::new(naming, "");
        b.linear(Half::Main, "img_in.proj", "x_embedder.proj");
        b.linear(Half::Fixed, "time_in.mlp.0", "time_text_embed.timestep_embedder.linear_1");
        b.linear(Half::Fixed, "time_in.mlp.2", "time_text_embed.timestep_embedder.linear_2");
        b.linear(Half::Fixed, "vector_in.in_layer", "time_text_embed.text_embedder.linear_1");
        b.linear(Half::Fixed, "vector_in.out_layer", "time_text_embed.text_embedder.linear_2");
        b.linear(Half::Fixed, "guidance_in.mlp.0", "time_text_embed.guidance_embedder.linear_1");
        b.linear(Half::Fixed, "guidance_in.mlp.2", "time_text_embed.guidance_embedder.linear_2");
        self.token_refiner(&mut b);

        for i in 0..self.double_layers {
            let g = format!("double_blocks.{i}");
            let d = format!("transformer_blocks.{i}");
            b.linear(Half::Fixed, &format!("{g}.img_mod.linear"), &format!("{d}.norm1.linear"));
            b.linear(Half::Fixed, &format!("{g}.txt_mod.linear"), &format!("{d}.norm1_context.linear"));
            for (stream, projections, out, norms, mlp) in [
                ("img", ["to_q", "to_k", "to_v"], "to_out.0", ["norm_q", "norm_k"], "ff"),
                (
                    "txt",
                    ["add_q_proj", "add_k_proj", "add_v_proj"],
                    "to_add_out",
                    ["norm_added_q", "norm_added_k"],
                    "ff_context",
                ),
            ] {
                let diffusers: Vec<String> =
                    projections.iter().map(|p| format!("{d}.attn.{p}")).collect();
                let diffusers: Vec<&str> = diffusers.iter().map(String::as_str).collect();
                let parts = ["q", "k", "v"].map(|p| format!("{stream}_attn_{p}"));
                let parts: Vec<&str> = parts.iter().map(String::as_str).collect();
                b.fused(
                    Half::Main,
                    &format!("{g}.{stream}_attn_qkv"),
                    &parts,
                    &diffusers,
                    SplitFormat::O,
                    None,
                    true,
                );
                b.weight(
                    Half::Main,
                    &format!("{g}.{stream}_attn_q_norm"),
                    &format!("{d}.attn.{}", norms[0]),
                );
                b.weight(
                    Half::Main,
                    &format!("{g}.{stream}_attn_k_norm"),
                    &format!("{d}.attn.{}", norms[1]),
                );
                b.linear(Half::Main, &format!("{g}.{stream}_attn_proj"), &format!("{d}.attn.{out}"));
                b.linear(Half::Main, &format!("{g}.{stream}_mlp.fc1"), &format!("{d}.{mlp}.net.0.proj"));
                b.linear(Half::Main, &format!("{g}.{stream}_mlp.fc2"), &format!("{d}.{mlp}.net.2"));
            }
        }

        let h = self.hidden_size;
        for i in 0..self.single_layers {
            let g = format!("single_blocks.{i}");
            let d = format!("single_transformer_blocks.{i}");
            b.linear(Half::Fixed, &format!("{g}.modulation.linear"), &format!("{d}.norm.linear"));
            let linear1 = [
                format!("{d}.attn.to_q"),
                format!("{d}.attn.to_k"),
                format!("{d}.attn.to_v"),
                format!("{d}.proj_mlp"),
            ];
            let linear1: Vec<&str> = linear1.iter().map(String::as_str).collect();
            b.fused(
                Half::Main,
                &format!("{g}.linear1"),
                &["linear1.q", "linear1.k", "linear1.v", "linear1.mlp"],
                &linear1,
                SplitFormat::O,
                Some(vec![0, h, 2 * h, 3 * h]),
                true,
            );
            b.weight(Half::Main, &format!("{g}.q_norm"), &format!("{d}.attn.norm_q"));
            b.weight(Half::Main, &format!("{g}.k_norm"), &format!("{d}.attn.norm_k"));
            let proj_out = format!("{d}.proj_out");
            b.fused(
                Half::Main,
                &format!("{g}.linear2"),
                &["linear2.attn", "linear2.mlp"],
                &[proj_out.as_str()],
                SplitFormat::I,
                Some(vec![0, h]),
                true,
            );
        }

        b.linear(Half::Fixed, "final_layer.adaLN_modulation.1", "norm_out.linear");
        b.linear(Half::Main, "final_layer.linear", "proj_out");
        b.finish()
    }

    fn token_refiner(&self, b: &mut TableBuilder) {
        let g = "txt_in";
        let d = "context_embedder";
        b.linear(Half::Fixed, &format!("{g}.input_embedder"), &format!("{d}.proj_in"));
        b.linear(
            Half::Fixed,
            &format!("{g}.t_embedder.mlp.0"),
            &format!("{d}.time_text_embed.timestep_embedder.linear_1"),
        );
        b.linear(
            Half::Fixed,
            &format!("{g}.t_embedder.mlp.2"),
            &format!("{d}.time_text_embed.timestep_embedder.linear_2"),
        );
        b.linear(
            Half::Fixed,
            &format!("{g}.c_embedder.linear_1"),
            &format!("{d}.time_text_embed.text_embedder.linear_1"),
        );
        b.linear(
            Half::Fixed,
            &format!("{g}.c_embedder.linear_2"),
            &format!("{d}.time_text_embed.text_embedder.linear_2"),
        );
        for j in 0..self.refiner_layers {
            let gb = format!("{g}.individual_token_refiner.blocks.{j}");
            let db = format!("{d}.token_refiner.refiner_blocks.{j}");
            b.linear(Half::Fixed, &format!("{gb}.norm1"), &format!("{db}.norm1"));
            let qkv = [
                format!("{db}.attn.to_q"),
                format!("{db}.attn.to_k"),
                format!("{db}.attn.to_v"),
            ];
            let qkv: Vec<&str> = qkv.iter().map(String::as_str).collect();
            b.fused(
                Half::Fixed,
                &format!("{gb}.self_attn_qkv"),
                &["self_attn_q", "self_attn_k", "self_attn_v"],
                &qkv,
                SplitFormat::O,
                None,
                true,
            );
            b.linear(Half::Fixed, &format!("{gb}.self_attn_proj"), &format!("{db}.attn.to_out.0"));
            b.linear(Half::Fixed, &format!("{gb}.norm2"), &format!("{db}.norm2"));
            b.linear(Half::Fixed, &format!("{gb}.mlp.fc1"), &format!("{db}.ff.net.0.proj"));
            b.linear(Half::Fixed, &format!("{gb}.mlp.fc2"), &format!("{db}.ff.net.2"));
            b.linear(Half::Fixed, &format!("{gb}.adaLN_modulation.1"), &format!("{db}.norm_out.linear"));
        }
    }
}
