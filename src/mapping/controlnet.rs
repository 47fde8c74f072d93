//! ControlNet tables: UNet-encoder copies and FLUX.1 ControlNets

use super::{
    FluxConfig, Half, ModelWeightMapping, NamingFormat, NetworkMapping, TableBuilder, UNetConfig,
};

/// Zero-initialized output projections have their biases scaled to match
/// the 1/8 output scaling applied at inference.
pub const ZERO_CONV_BIAS_SCALE: f32 = 0.125;

/// Tables of a ControlNet and its hint encoder.
#[derive(Debug, Clone, Default)]
pub struct ControlNetMapping {
    pub main: ModelWeightMapping,
    pub fixed: ModelWeightMapping,
    pub hint: ModelWeightMapping,
}

impl ControlNetMapping {
    fn from_network(network: NetworkMapping, hint: ModelWeightMapping) -> Self {
        Self {
            main: network.main,
            fixed: network.fixed,
            hint,
        }
    }

    /// Number of entries across all three tables.
    pub fn len(&self) -> usize {
        self.main.len() + self.fixed.len() + self.hint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// ControlNet copying the encoder half of `unet`.
///
/// GenerativeModels keys carry the `model.control_model.` prefix. `union`
/// adds the control-type embedding of union ControlNets (Diffusers only).
pub fn controlnet_mapping(unet: &UNetConfig, naming: NamingFormat, union: bool) -> ControlNetMapping {
    let mut b = TableBuilder::new(naming, "model.control_model.");
    unet.walk_encoder(&mut b);
    for n in 0..unet.input_block_count() {
        b.linear_scaled_bias(
            Half::Main,
            &format!("zero_convs.{n}.0"),
            &format!("controlnet_down_blocks.{n}"),
            ZERO_CONV_BIAS_SCALE,
        );
    }
    b.linear_scaled_bias(
        Half::Main,
        "middle_block_out.0",
        "controlnet_mid_block",
        ZERO_CONV_BIAS_SCALE,
    );
    if union && naming == NamingFormat::Diffusers {
        b.linear(Half::Main, "control_add_embedding.linear_1", "control_add_embedding.linear_1");
        b.linear(Half::Main, "control_add_embedding.linear_2", "control_add_embedding.linear_2");
        b.raw(Half::Main, "task_embedding", "task_embedding");
    }
    let network = b.finish();

    let mut h = TableBuilder::new(naming, "model.control_model.");
    h.linear(Half::Main, "input_hint_block.0", "controlnet_cond_embedding.conv_in");
    for j in 0..6 {
        h.linear(
            Half::Main,
            &format!("input_hint_block.{}", 2 * (j + 1)),
            &format!("controlnet_cond_embedding.blocks.{j}"),
        );
    }
    h.linear(Half::Main, "input_hint_block.14", "controlnet_cond_embedding.conv_out");
    ControlNetMapping::from_network(network, h.finish().main)
}

/// FLUX.1 ControlNet with `double` joint blocks and `single` single blocks
/// (Diffusers naming).
pub fn flux_controlnet_mapping(double: usize, single: usize, union: bool) -> ControlNetMapping {
    let config = FluxConfig::dev();
    let mut b = TableBuilder::new(NamingFormat::Diffusers, "");
    b.linear(Half::Main, "img_in", "x_embedder");
    b.linear(Half::Main, "controlnet_x_embedder", "controlnet_x_embedder");
    b.linear(Half::Fixed, "txt_in", "context_embedder");
    b.linear(Half::Fixed, "time_in.in_layer", "time_text_embed.timestep_embedder.linear_1");
    b.linear(Half::Fixed, "time_in.out_layer", "time_text_embed.timestep_embedder.linear_2");
    b.linear(Half::Fixed, "vector_in.in_layer", "time_text_embed.text_embedder.linear_1");
    b.linear(Half::Fixed, "vector_in.out_layer", "time_text_embed.text_embedder.linear_2");
    b.linear(Half::Fixed, "guidance_in.in_layer", "time_text_embed.guidance_embedder.linear_1");
    b.linear(Half::Fixed, "guidance_in.out_layer", "time_text_embed.guidance_embedder.linear_2");
    if union {
        b.weight(Half::Fixed, "controlnet_mode_embedder", "controlnet_mode_embedder");
    }
    for i in 0..double {
        config.double_block(&mut b, &format!("double_blocks.{i}"), &format!("transformer_blocks.{i}"));
        b.linear_scaled_bias(
            Half::Main,
            &format!("zero_convs.double.{i}"),
            &format!("controlnet_blocks.{i}"),
            ZERO_CONV_BIAS_SCALE,
        );
    }
    for i in 0..single {
        config.single_block(
            &mut b,
            &format!("single_blocks.{i}"),
            &format!("single_transformer_blocks.{i}"),
        );
        b.linear_scaled_bias(
            Half::Main,
            &format!("zero_convs.single.{i}"),
            &format!("controlnet_single_blocks.{i}"),
            ZERO_CONV_BIAS_SCALE,
        );
    }
    ControlNetMapping::from_network(b.finish(), ModelWeightMapping::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_zero_convs_and_hint() {
        let mapping = controlnet_mapping(&UNetConfig::v1(), NamingFormat::GenerativeModels, false);
        let bias = &mapping.main["model.control_model.zero_convs.11.0.bias"];
        assert_eq!(bias.scale, ZERO_CONV_BIAS_SCALE);
        assert_eq!(mapping.main["model.control_model.zero_convs.11.0.weight"].scale, 1.0);
        assert!(mapping.main.contains_key("model.control_model.middle_block_out.0.bias"));
        assert!(!mapping.main.keys().any(|k| k.contains("output_blocks")));
        assert_eq!(mapping.hint.len(), 16);
        assert!(mapping.fixed.is_empty());
    }

    #[test]
    fn test_sdxl_diffusers_union() {
        let mapping = controlnet_mapping(&UNetConfig::sdxl_base(), NamingFormat::Diffusers, true);
        assert!(mapping.main.contains_key("controlnet_down_blocks.8.bias"));
        assert!(!mapping.main.contains_key("controlnet_down_blocks.9.bias"));
        assert!(mapping.main.contains_key("control_add_embedding.linear_2.weight"));
        assert!(mapping
            .fixed
            .contains_key("down_blocks.2.attentions.1.transformer_blocks.9.attn2.to_k.weight"));
        assert!(mapping.hint.contains_key("controlnet_cond_embedding.blocks.5.weight"));
    }

    #[test]
    fn test_flux_block_counts() {
        let mapping = flux_controlnet_mapping(2, 1, true);
        assert!(mapping.main.contains_key("controlnet_blocks.1.weight"));
        assert!(!mapping.main.contains_key("controlnet_blocks.2.weight"));
        assert!(mapping.main.contains_key("single_transformer_blocks.0.proj_out.weight"));
        assert_eq!(
            mapping.main["controlnet_single_blocks.0.bias"].scale,
            ZERO_CONV_BIAS_SCALE
        );
        assert!(mapping.fixed.contains_key("controlnet_mode_embedder.weight"));
    }
}
