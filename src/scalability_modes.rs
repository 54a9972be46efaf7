//! Parsing of scalability mode strings (`L3T2`, `S2T3`, `L1T2_KEY`, ...).

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Spatial/temporal layering of one encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScalabilityMode {
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub ksvc: bool,
}

impl Default for ScalabilityMode {
    fn default() -> Self {
        Self {
            spatial_layers: 1,
            temporal_layers: 1,
            ksvc: false,
        }
    }
}

impl FromStr for ScalabilityMode {
    type Err = std::convert::Infallible;

    // Unrecognized strings fall back to the single-layer default, matching
    // how endpoints treat unknown modes.
    fn from_str(scalability_mode: &str) -> Result<Self, Self::Err> {
        static REGEX: OnceCell<Regex> = OnceCell::new();

        Ok(REGEX
            .get_or_init(|| Regex::new(r"^[LS]([1-9][0-9]?)T([1-9][0-9]?)(_KEY)?").unwrap())
            .captures(scalability_mode)
            .map(|captures| ScalabilityMode {
                spatial_layers: captures.get(1).unwrap().as_str().parse().unwrap(),
                temporal_layers: captures.get(2).unwrap().as_str().parse().unwrap(),
                ksvc: captures.get(3).is_some(),
            })
            .unwrap_or_default())
    }
}

impl TryFrom<String> for ScalabilityMode {
    type Error = std::convert::Infallible;

    fn try_from(scalability_mode: String) -> Result<Self, Self::Error> {
        scalability_mode.parse()
    }
}

impl From<ScalabilityMode> for String {
    fn from(scalability_mode: ScalabilityMode) -> Self {
        format!(
            "{}{}T{}{}",
            if scalability_mode.ksvc { 'L' } else { 'S' },
            scalability_mode.spatial_layers,
            scalability_mode.temporal_layers,
            if scalability_mode.ksvc { "_KEY" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layered_modes() {
        assert_eq!(
            "L3T2".parse::<ScalabilityMode>().unwrap(),
            ScalabilityMode {
                spatial_layers: 3,
                temporal_layers: 2,
                ksvc: false,
            }
        );

        assert_eq!(
            "S2T3".parse::<ScalabilityMode>().unwrap(),
            ScalabilityMode {
                spatial_layers: 2,
                temporal_layers: 3,
                ksvc: false,
            }
        );

        assert_eq!(
            "L2T3_KEY".parse::<ScalabilityMode>().unwrap(),
            ScalabilityMode {
                spatial_layers: 2,
                temporal_layers: 3,
                ksvc: true,
            }
        );
    }

    #[test]
    fn unknown_modes_collapse_to_single_layer() {
        for bogus in ["", "foo", "S0T3", "L1T0", "T2L3"] {
            assert_eq!(
                bogus.parse::<ScalabilityMode>().unwrap(),
                ScalabilityMode::default(),
                "{}",
                bogus
            );
        }
    }
}
