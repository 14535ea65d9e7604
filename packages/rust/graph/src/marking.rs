//! Traffic Light Protocol markings.

use serde::{Deserialize, Serialize};

use ctirelay_shared::CtiRelayError;

/// A TLP 1.0 marking definition with its well-known STIX id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlpMarking {
    White,
    Green,
    Amber,
    Red,
}

impl TlpMarking {
    /// The marking-definition id every STIX producer uses for this level.
    pub fn id(self) -> &'static str {
        match self {
            Self::White => "marking-definition--613f2e26-407d-48c7-9eca-b8e91df99dc9",
            Self::Green => "marking-definition--34098fce-860f-48ae-8e50-ebd3cc5e41da",
            Self::Amber => "marking-definition--f88d31f6-486f-44da-b317-01333bde0b82",
            Self::Red => "marking-definition--5e57c739-391a-4eb3-b6be-7d15ca92d5ed",
        }
    }

    /// Lower-case level name.
    pub fn name(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Green => "green",
            Self::Amber => "amber",
            Self::Red => "red",
        }
    }
}

impl std::fmt::Display for TlpMarking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TLP:{}", self.name().to_uppercase())
    }
}

impl std::str::FromStr for TlpMarking {
    type Err = CtiRelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = s.trim().to_lowercase();
        let level = level.strip_prefix("tlp:").unwrap_or(&level);
        match level {
            "white" | "clear" => Ok(Self::White),
            "green" => Ok(Self::Green),
            "amber" => Ok(Self::Amber),
            "red" => Ok(Self::Red),
            _ => Err(CtiRelayError::config(format!("invalid tlp: {s}"))),
        }
    }
}
