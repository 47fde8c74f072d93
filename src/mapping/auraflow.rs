//! AuraFlow tables

use super::{Half, NamingFormat, NetworkMapping, TableBuilder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuraFlowConfig {
    pub hidden_size: usize,
    pub double_layers: usize,
    pub single_layers: usize,
}

impl AuraFlowConfig {
    pub fn v0_2() -> Self {
        Self {
            hidden_size: 3072,
            double_layers: 4,
            single_layers: 32,
        }
    }

    pub fn expected_tensors(&self) -> usize {
        11 + 16 * self.double_layers + 8 * self.single_layers
    }

    /// AuraFlow layers carry no biases.
    pub fn mapping(&self, naming: NamingFormat) -> NetworkMapping {
        let mut b = TableBuilder::new(naming, "model.");
        b.linear(Half::Main, "init_x_linear", "pos_embed.proj");
        b.raw(Half::Main, "positional_encoding", "pos_embed.pos_embed");
        b.raw(Half::Fixed, "register_tokens", "register_tokens");
        b.weight(Half::Fixed, "cond_seq_linear", "context_embedder");
        b.linear(Half::Fixed, "t_embedder.mlp.0", "time_step_proj.linear_1");
        b.linear(Half::Fixed, "t_embedder.mlp.2", "time_step_proj.linear_2");

        for i in 0..self.double_layers {
            let g = format!("double_layers.{i}");
            let d = format!("joint_transformer_blocks.{i}");
            for (gp, dp) in [
                ("attn.w1q", "attn.to_q"),
                ("attn.w1k", "attn.to_k"),
                ("attn.w1v", "attn.to_v"),
                ("attn.w1o", "attn.to_out.0"),
                ("attn.w2q", "attn.add_q_proj"),
                ("attn.w2k", "attn.add_k_proj"),
                ("attn.w2v", "attn.add_v_proj"),
                ("attn.w2o", "attn.to_add_out"),
                ("mlpX.c_fc1", "ff.linear_1"),
                ("mlpX.c_fc2", "ff.linear_2"),
                ("mlpX.c_proj", "ff.out_projection"),
                ("mlpC.c_fc1", "ff_context.linear_1"),
                ("mlpC.c_fc2", "ff_context.linear_2"),
                ("mlpC.c_proj", "ff_context.out_projection"),
            ] {
                b.weight(Half::Main, &format!("{g}.{gp}"), &format!("{d}.{dp}"));
            }
            b.weight(Half::Fixed, &format!("{g}.modX.1"), &format!("{d}.norm1.linear"));
            b.weight(Half::Fixed, &format!("{g}.modC.1"), &format!("{d}.norm1_context.linear"));
        }

        for i in 0..self.single_layers {
            let g = format!("single_layers.{i}");
            let d = format!("single_transformer_blocks.{i}");
            for (gp, dp) in [
                ("attn.w1q", "attn.to_q"),
                ("attn.w1k", "attn.to_k"),
                ("attn.w1v", "attn.to_v"),
                ("attn.w1o", "attn.to_out.0"),
                ("mlp.c_fc1", "ff.linear_1"),
                ("mlp.c_fc2", "ff.linear_2"),
                ("mlp.c_proj", "ff.out_projection"),
            ] {
                b.weight(Half::Main, &format!("{g}.{gp}"), &format!("{d}.{dp}"));
            }
            b.weight(Half::Fixed, &format!("{g}.modCX.1"), &format!("{d}.norm1.linear"));
        }

        b.weight(Half::Fixed, "modF.1", "norm_out.linear");
        b.weight(Half::Main, "final_linear", "proj_out");
        b.finish()
    }
}
