//! Adapter key normalization.
//!
//! Trainers spell the same adapter factor many ways. Every recognized key is
//! rewritten to `<stem>.<role>` where the stem is the dotted module path
//! joined with `_` and the role is one of [`AdapterRole`]'s suffixes. The
//! rewritten key is added to the state dict as an alias; originals stay.

use crate::archive::StateDict;

/// Tensor role of an adapter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterRole {
    Up,
    Down,
    Mid,
    Alpha,
    HadaW1A,
    HadaW1B,
    HadaW2A,
    HadaW2B,
    Diff,
    DiffBias,
}

impl AdapterRole {
    pub const ALL: [AdapterRole; 10] = [
        AdapterRole::Up,
        AdapterRole::Down,
        AdapterRole::Mid,
        AdapterRole::Alpha,
        AdapterRole::HadaW1A,
        AdapterRole::HadaW1B,
        AdapterRole::HadaW2A,
        AdapterRole::HadaW2B,
        AdapterRole::Diff,
        AdapterRole::DiffBias,
    ];

    /// Suffix of the normalized key, after the stem and a `.`.
    pub fn suffix(self) -> &'static str {
        match self {
            AdapterRole::Up => "lora_up.weight",
            AdapterRole::Down => "lora_down.weight",
            AdapterRole::Mid => "lora_mid.weight",
            AdapterRole::Alpha => "alpha",
            AdapterRole::HadaW1A => "hada_w1_a",
            AdapterRole::HadaW1B => "hada_w1_b",
            AdapterRole::HadaW2A => "hada_w2_a",
            AdapterRole::HadaW2B => "hada_w2_b",
            AdapterRole::Diff => "diff",
            AdapterRole::DiffBias => "diff_b",
        }
    }

    /// Role tag used in store keys; dense diffs are written without one.
    pub fn store_tag(self) -> Option<&'static str> {
        match self {
            AdapterRole::Up => Some("up"),
            AdapterRole::Down => Some("down"),
            AdapterRole::Mid => Some("mid"),
            AdapterRole::HadaW1A => Some("w1_a"),
            AdapterRole::HadaW1B => Some("w1_b"),
            AdapterRole::HadaW2A => Some("w2_a"),
            AdapterRole::HadaW2B => Some("w2_b"),
            AdapterRole::Alpha | AdapterRole::Diff | AdapterRole::DiffBias => None,
        }
    }
}

/// External suffixes and the role they denote, longest spellings first.
const DIALECTS: &[(&str, AdapterRole)] = &[
    // PEFT
    (".lora_B.default.weight", AdapterRole::Up),
    (".lora_A.default.weight", AdapterRole::Down),
    (".lora_B.weight", AdapterRole::Up),
    (".lora_A.weight", AdapterRole::Down),
    // diffusers
    (".lora.up.weight", AdapterRole::Up),
    (".lora.down.weight", AdapterRole::Down),
    // kohya, LyCORIS and OneTrainer
    (".lora_up.weight", AdapterRole::Up),
    (".lora_down.weight", AdapterRole::Down),
    (".lora_mid.weight", AdapterRole::Mid),
    (".alpha", AdapterRole::Alpha),
    (".hada_w1_a", AdapterRole::HadaW1A),
    (".hada_w1_b", AdapterRole::HadaW1B),
    (".hada_w2_a", AdapterRole::HadaW2A),
    (".hada_w2_b", AdapterRole::HadaW2B),
    (".diff", AdapterRole::Diff),
    (".diff_b", AdapterRole::DiffBias),
];

/// Inline operator suffixes. Keys read `<module>.<parameter><suffix>`; the
/// parameter component is not part of the stem.
const INLINE_OPERATORS: &[(&str, AdapterRole)] = &[
    ("::lora::0", AdapterRole::Up),
    ("::lora::1", AdapterRole::Down),
    ("::diff::0", AdapterRole::Diff),
];

/// Split an inline-operator key, or `None` when `key` is not one.
///
/// A dense diff of a `bias` parameter becomes [`AdapterRole::DiffBias`].
fn split_inline(key: &str) -> Option<(&str, AdapterRole)> {
    INLINE_OPERATORS.iter().find_map(|(suffix, role)| {
        let (module, parameter) = key.strip_suffix(suffix)?.rsplit_once('.')?;
        let role = match (role, parameter) {
            (AdapterRole::Diff, "bias") => AdapterRole::DiffBias,
            _ => *role,
        };
        (!module.is_empty()).then_some((module, role))
    })
}

/// Split an adapter key into its module path and role.
fn split_role(key: &str) -> Option<(&str, AdapterRole)> {
    if INLINE_OPERATORS.iter().any(|(suffix, _)| key.ends_with(suffix)) {
        return split_inline(key);
    }
    DIALECTS.iter().find_map(|(suffix, role)| {
        key.strip_suffix(suffix)
            .filter(|stem| !stem.is_empty())
            .map(|stem| (stem, *role))
    })
}

/// Module path joined with `_`, without `base_model` and a leading
/// `transformer` segment.
fn flatten_stem(stem: &str) -> String {
    let mut parts: Vec<&str> = stem.split('.').collect();
    if parts.len() > 1 && parts[1] == "base_model" {
        parts.remove(1);
    }
    if parts.len() > 1 && parts[0] == "base_model" {
        parts.remove(0);
    }
    if parts.len() > 1 && parts.first() == Some(&"transformer") {
        parts.remove(0);
    }
    parts.join("_")
}

/// Normalized spelling of an adapter key, or `None` for other tensors.
///
/// Normalizing a normalized key returns it unchanged.
pub fn normalize_key(key: &str) -> Option<String> {
    let (stem, role) = split_role(key)?;
    Some(format!("{}.{}", flatten_stem(stem), role.suffix()))
}

/// Stem and role of a key already in normalized form.
pub fn parse_normalized(key: &str) -> Option<(&str, AdapterRole)> {
    let (stem, suffix) = key.split_once('.')?;
    let role = AdapterRole::ALL.into_iter().find(|r| r.suffix() == suffix)?;
    Some((stem, role))
}

/// Alias every adapter key under its normalized spelling.
///
/// Returns the number of aliases added.
pub fn normalize_state_dict(state_dict: &mut StateDict) -> usize {
    let mut added = 0;
    for key in state_dict.key_snapshot() {
        if let Some(normalized) = normalize_key(&key) {
            if normalized != key && state_dict.alias(normalized, &key) {
                added += 1;
            }
        }
    }
    tracing::debug!(added, "normalized adapter keys");
    added
}

/// The stem with 0, 1 and 2 leading `_` components removed.
///
/// Dialects keep different numbers of prefix components (`lora_unet_`,
/// `lora_te1_`, `diffusion_model_`) in front of the module path.
pub fn candidate_stems(stem: &str) -> Vec<String> {
    let parts: Vec<&str> = stem.split('_').collect();
    (0..=2)
        .filter(|&i| i < parts.len())
        .map(|i| parts[i..].join("_"))
        .collect()
}

/// Table keys a normalized adapter key may target, most specific last.
pub fn candidate_keys(stem: &str, role: AdapterRole) -> Vec<String> {
    candidate_stems(stem)
        .into_iter()
        .flat_map(|s| match role {
            AdapterRole::Diff => vec![s.clone(), format!("{s}.weight")],
            AdapterRole::DiffBias => vec![format!("{s}.bias")],
            _ => vec![format!("{s}.weight")],
        })
        .collect()
}

/// Every character outside `[A-Za-z0-9]` becomes `_`; the result is lowercased.
pub fn clean_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_dialect_rewrites() {
        let cases = [
            (
                "base_model.model.down_blocks.1.attn.to_k.lora_B.weight",
                "model_down_blocks_1_attn_to_k.lora_up.weight",
            ),
            (
                "transformer.single_transformer_blocks.0.attn.to_q.lora_A.default.weight",
                "single_transformer_blocks_0_attn_to_q.lora_down.weight",
            ),
            (
                "unet.down_blocks.0.attentions.0.proj_in.lora.up.weight",
                "unet_down_blocks_0_attentions_0_proj_in.lora_up.weight",
            ),
            (
                "diffusion_model.middle_block.1.proj_out.weight::lora::1",
                "diffusion_model_middle_block_1_proj_out.lora_down.weight",
            ),
            (
                "lora_unet_input_blocks_4_1_transformer_blocks_0_attn2_to_k.weight::lora::0",
                "lora_unet_input_blocks_4_1_transformer_blocks_0_attn2_to_k.lora_up.weight",
            ),
            ("diffusion_model.input_blocks.0.0.weight::diff::0", "diffusion_model_input_blocks_0_0.diff"),
            ("diffusion_model.input_blocks.0.0.bias::diff::0", "diffusion_model_input_blocks_0_0.diff_b"),
            ("base_model.base_model.model.x.lora_A.weight", "model_x.lora_down.weight"),
            (
                "diffusion_model.blocks.3.ffn.0.lora_up.weight",
                "diffusion_model_blocks_3_ffn_0.lora_up.weight",
            ),
            ("diffusion_model.blocks.3.ffn.0.alpha", "diffusion_model_blocks_3_ffn_0.alpha"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize_key(input).as_deref(), Some(expected), "{input}");
        }
        assert_eq!(normalize_key("emb_params"), None);
        assert_eq!(normalize_key("proj_out::lora::0"), None);
        assert_eq!(normalize_key(".lora_up.weight"), None);
    }

    #[test]
    fn test_parse_normalized() {
        assert_eq!(
            parse_normalized("lora_unet_conv_in.hada_w2_b"),
            Some(("lora_unet_conv_in", AdapterRole::HadaW2B))
        );
        assert_eq!(parse_normalized("a.b.lora_up.weight"), None);
        assert_eq!(parse_normalized("clip_l"), None);
    }

    #[test]
    fn test_normalize_state_dict_adds_aliases() {
        use crate::archive::{DType, DataLocation, TensorDescriptor};
        let mut sd = StateDict::new();
        for key in ["a.b.lora_A.weight", "lora_unet_c.lora_up.weight"] {
            sd.insert(
                key,
                TensorDescriptor {
                    key: key.into(),
                    shape: vec![1],
                    dtype: DType::F32,
                    location: DataLocation::Range { start: 0, end: 4 },
                },
            );
        }
        assert_eq!(normalize_state_dict(&mut sd), 1);
        assert!(sd.contains_key("a.b.lora_A.weight"));
        assert!(sd.contains_key("a_b.lora_down.weight"));
        assert_eq!(normalize_state_dict(&mut sd), 0);
    }

    #[test]
    fn test_candidate_keys() {
        assert_eq!(
            candidate_keys("lora_te1_text_model_encoder_layers_0_mlp_fc1", AdapterRole::Up),
            vec![
                "lora_te1_text_model_encoder_layers_0_mlp_fc1.weight",
                "te1_text_model_encoder_layers_0_mlp_fc1.weight",
                "text_model_encoder_layers_0_mlp_fc1.weight",
            ]
        );
        assert_eq!(
            candidate_keys("lora_unet_scale_shift_table", AdapterRole::Diff)[4..],
            ["scale_shift_table".to_string(), "scale_shift_table.weight".to_string()]
        );
        assert_eq!(candidate_keys("x", AdapterRole::DiffBias), vec!["x.bias"]);
    }

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("My LoRA v1.2 (final)"), "my_lora_v1_2__final_");
        assert_eq!(clean_filename("épique"), "_pique");
    }

    fn dotted_path() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9_]{0,6}", 1..6).prop_map(|parts| parts.join("."))
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(
            path in dotted_path(),
            dialect in 0..DIALECTS.len(),
            prefix in prop::sample::select(vec!["", "base_model.model.", "transformer."]),
        ) {
            let key = format!("{prefix}{path}{}", DIALECTS[dialect].0);
            if let Some(once) = normalize_key(&key) {
                let twice = normalize_key(&once);
                prop_assert_eq!(twice.as_deref(), Some(once.as_str()));
                prop_assert!(parse_normalized(&once).is_some());
            }
        }

        #[test]
        fn prop_inline_operators_drop_parameter_component(
            path in dotted_path(),
            operator in 0..INLINE_OPERATORS.len(),
        ) {
            let key = format!("{path}.weight{}", INLINE_OPERATORS[operator].0);
            let once = normalize_key(&key).unwrap();
            let (stem, _) = parse_normalized(&once).unwrap();
            prop_assert_eq!(stem, flatten_stem(&path));
            let twice = normalize_key(&once);
            prop_assert_eq!(twice.as_deref(), Some(once.as_str()));
        }
    }
}
