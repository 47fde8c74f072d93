//! ESRGAN (RRDB) upscaler tables

use super::{ModelWeightElement, ModelWeightMapping};

/// Layout of a residual-in-residual dense block network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RRDBConfig {
    /// Number of RRDB blocks in the trunk.
    pub blocks: usize,
    /// Number of 2x nearest-upsample convolutions (1: 2x, 2: 4x).
    pub upsample_convs: usize,
}

impl RRDBConfig {
    /// Upscale factor of the network.
    pub fn scale_factor(&self) -> usize {
        1 << self.upsample_convs
    }
}

/// External key to canonical name for an RRDB network.
///
/// Canonical names follow the current layout (`conv_first`,
/// `body.N.rdbK.convM`, `conv_up1`); `legacy` selects the sequential
/// `model.N` spelling of older checkpoints.
pub fn rrdb_mapping(config: &RRDBConfig, legacy: bool) -> ModelWeightMapping {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut conv = |current: String, old: String| {
        for suffix in ["weight", "bias"] {
            let name = format!("{current}.{suffix}");
            let key = if legacy {
                format!("{old}.{suffix}")
            } else {
                name.clone()
            };
            pairs.push((key, name));
        }
    };

    conv("conv_first".into(), "model.0".into());
    for n in 0..config.blocks {
        for k in 1..=3 {
            for m in 1..=5 {
                conv(
                    format!("body.{n}.rdb{k}.conv{m}"),
                    format!("model.1.sub.{n}.RDB{k}.conv{m}.0"),
                );
            }
        }
    }
    conv("conv_body".into(), format!("model.1.sub.{}", config.blocks));
    let u = config.upsample_convs;
    for i in 0..u {
        conv(format!("conv_up{}", i + 1), format!("model.{}", 3 + 3 * i));
    }
    conv("conv_hr".into(), format!("model.{}", 3 * u + 2));
    conv("conv_last".into(), format!("model.{}", 3 * u + 4));

    pairs
        .into_iter()
        .map(|(key, name)| (key, ModelWeightElement::single(name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_layout() {
        let config = RRDBConfig {
            blocks: 23,
            upsample_convs: 2,
        };
        let mapping = rrdb_mapping(&config, false);
        // 23 blocks of 15 convolutions plus 6 others, each with a bias.
        assert_eq!(mapping.len(), 2 * (23 * 15 + 6));
        assert!(mapping.contains_key("body.22.rdb3.conv5.weight"));
        assert_eq!(config.scale_factor(), 4);
    }

    #[test]
    fn test_legacy_indices() {
        let x4 = rrdb_mapping(
            &RRDBConfig {
                blocks: 2,
                upsample_convs: 2,
            },
            true,
        );
        assert_eq!(x4["model.1.sub.1.RDB2.conv4.0.weight"].names, vec!["body.1.rdb2.conv4.weight"]);
        assert_eq!(x4["model.1.sub.2.bias"].names, vec!["conv_body.bias"]);
        assert_eq!(x4["model.6.weight"].names, vec!["conv_up2.weight"]);
        assert_eq!(x4["model.8.weight"].names, vec!["conv_hr.weight"]);
        assert_eq!(x4["model.10.weight"].names, vec!["conv_last.weight"]);

        let x2 = rrdb_mapping(
            &RRDBConfig {
                blocks: 2,
                upsample_convs: 1,
            },
            true,
        );
        assert_eq!(x2["model.5.weight"].names, vec!["conv_hr.weight"]);
        assert_eq!(x2["model.7.weight"].names, vec!["conv_last.weight"]);
    }
}
