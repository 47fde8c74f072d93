//! FLUX.1 tables

use super::{Half, NamingFormat, NetworkMapping, SplitFormat, TableBuilder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxConfig {
    pub hidden_size: usize,
    pub double_layers: usize,
    pub single_layers: usize,
    pub mlp_ratio: usize,
    /// Guidance-distilled checkpoints embed the guidance scale.
    pub guidance_embed: bool,
}

impl FluxConfig {
    pub fn dev() -> Self {
        Self {
            hidden_size: 3072,
            double_layers: 19,
            single_layers: 38,
            mlp_ratio: 4,
            guidance_embed: true,
        }
    }

    pub fn schnell() -> Self {
        Self {
            guidance_embed: false,
            ..Self::dev()
        }
    }

    /// Offsets of q, k, v and the MLP input inside a single block's `linear1`.
    pub fn linear1_offsets(&self) -> Vec<usize> {
        let h = self.hidden_size;
        vec![0, h, 2 * h, 3 * h]
    }

    /// Offsets of the attention output and MLP output inside `linear2`.
    pub fn linear2_offsets(&self) -> Vec<usize> {
        vec![0, self.hidden_size]
    }

    /// Number of tensors a complete checkpoint of this layout carries.
    pub fn expected_tensors(&self) -> usize {
        let guidance = if self.guidance_embed { 4 } else { 0 };
        16 + guidance + 32 * self.double_layers + 15 * self.single_layers
    }

    pub fn mapping(&self, naming: NamingFormat) -> NetworkMapping {
        let mut b = TableBuilder::new(naming, "");
        self.globals(&mut b);
        for i in 0..self.double_layers {
            self.double_block(&mut b, &format!("double_blocks.{i}"), &format!("transformer_blocks.{i}"));
        }
        for i in 0..self.single_layers {
            self.single_block(
                &mut b,
                &format!("single_blocks.{i}"),
                &format!("single_transformer_blocks.{i}"),
            );
        }
        b.linear(Half::Fixed, "final_layer.adaLN_modulation.1", "norm_out.linear");
        b.linear(Half::Main, "final_layer.linear", "proj_out");
        b.finish()
    }

    fn globals(&self, b: &mut TableBuilder) {
        b.linear(Half::Main, "img_in", "x_embedder");
        b.linear(Half::Fixed, "txt_in", "context_embedder");
        b.linear(Half::Fixed, "time_in.in_layer", "time_text_embed.timestep_embedder.linear_1");
        b.linear(Half::Fixed, "time_in.out_layer", "time_text_embed.timestep_embedder.linear_2");
        b.linear(Half::Fixed, "vector_in.in_layer", "time_text_embed.text_embedder.linear_1");
        b.linear(Half::Fixed, "vector_in.out_layer", "time_text_embed.text_embedder.linear_2");
        if self.guidance_embed {
            b.linear(Half::Fixed, "guidance_in.in_layer", "time_text_embed.guidance_embedder.linear_1");
            b.linear(Half::Fixed, "guidance_in.out_layer", "time_text_embed.guidance_embedder.linear_2");
        }
    }

    /// Joint image/text block. Also used by the FLUX ControlNet tables.
    pub(crate) fn double_block(&self, b: &mut TableBuilder, g: &str, d: &str) {
        b.linear(Half::Fixed, &format!("{g}.img_mod.lin"), &format!("{d}.norm1.linear"));
        b.linear(Half::Fixed, &format!("{g}.txt_mod.lin"), &format!("{d}.norm1_context.linear"));
        for (stream, projections, out, norms, mlp) in [
            (
                "img",
                ["to_q", "to_k", "to_v"],
                "to_out.0",
                ["norm_q", "norm_k"],
                "ff",
            ),
            (
                "txt",
                ["add_q_proj", "add_k_proj", "add_v_proj"],
                "to_add_out",
                ["norm_added_q", "norm_added_k"],
                "ff_context",
            ),
        ] {
            let diffusers: Vec<String> = projections.iter().map(|p| format!("{d}.attn.{p}")).collect();
            let diffusers: Vec<&str> = diffusers.iter().map(String::as_str).collect();
            b.fused(
                Half::Main,
                &format!("{g}.{stream}_attn.qkv"),
                &["q", "k", "v"],
                &diffusers,
                SplitFormat::O,
                None,
                true,
            );
            b.raw(
                Half::Main,
                &format!("{g}.{stream}_attn.norm.query_norm.scale"),
                &format!("{d}.attn.{}.weight", norms[0]),
            );
            b.raw(
                Half::Main,
                &format!("{g}.{stream}_attn.norm.key_norm.scale"),
                &format!("{d}.attn.{}.weight", norms[1]),
            );
            b.linear(Half::Main, &format!("{g}.{stream}_attn.proj"), &format!("{d}.attn.{out}"));
            b.linear(Half::Main, &format!("{g}.{stream}_mlp.0"), &format!("{d}.{mlp}.net.0.proj"));
            b.linear(Half::Main, &format!("{g}.{stream}_mlp.2"), &format!("{d}.{mlp}.net.2"));
        }
    }

    /// Parallel attention/MLP block with packed `linear1` and `linear2`.
    pub(crate) fn single_block(&self, b: &mut TableBuilder, g: &str, d: &str) {
        b.linear(Half::Fixed, &format!("{g}.modulation.lin"), &format!("{d}.norm.linear"));
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
            Some(self.linear1_offsets()),
            true,
        );
        b.raw(
            Half::Main,
            &format!("{g}.norm.query_norm.scale"),
            &format!("{d}.attn.norm_q.weight"),
        );
        b.raw(
            Half::Main,
            &format!("{g}.norm.key_norm.scale"),
            &format!("{d}.attn.norm_k.weight"),
        );
        let proj_out = format!("{d}.proj_out");
        b.fused(
            Half::Main,
            &format!("{g}.linear2"),
            &["linear2.attn", "linear2.mlp"],
            &[proj_out.as_str()],
            SplitFormat::I,
            Some(self.linear2_offsets()),
            true,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear1_offsets() {
        let mapping = FluxConfig::dev().mapping(NamingFormat::GenerativeModels);
        let element = &mapping.main["single_blocks.0.linear1.weight"];
        assert_eq!(element.offsets, Some(vec![0, 3072, 6144, 9216]));
        assert_eq!(element.names[3], "single_blocks.0.linear1.mlp.weight");
    }

    #[test]
    fn test_linear2_is_input_packed_in_both_dialects() {
        let config = FluxConfig::dev();
        for naming in [NamingFormat::GenerativeModels, NamingFormat::Diffusers] {
            let mapping = config.mapping(naming);
            let key = match naming {
                NamingFormat::GenerativeModels => "single_blocks.5.linear2",
                NamingFormat::Diffusers => "single_transformer_blocks.5.proj_out",
            };
            let weight = &mapping.main[&format!("{key}.weight")];
            assert_eq!(weight.format, SplitFormat::I);
            assert_eq!(weight.count(), 2);
            let bias = &mapping.main[&format!("{key}.bias")];
            assert_eq!(bias.names, vec!["single_blocks.5.linear2.attn.bias"]);
        }
    }

    #[test]
    fn test_guidance_is_optional() {
        let dev = FluxConfig::dev().mapping(NamingFormat::Diffusers);
        let schnell = FluxConfig::schnell().mapping(NamingFormat::Diffusers);
        assert!(dev.fixed.contains_key("time_text_embed.guidance_embedder.linear_1.weight"));
        assert!(!schnell.fixed.contains_key("time_text_embed.guidance_embedder.linear_1.weight"));
        assert_eq!(dev.canonical_names().len(), schnell.canonical_names().len() + 4);
    }

    #[test]
    fn test_dialects_agree() {
        let config = FluxConfig::dev();
        assert_eq!(
            config.mapping(NamingFormat::GenerativeModels).canonical_names(),
            config.mapping(NamingFormat::Diffusers).canonical_names()
        );
    }
}
