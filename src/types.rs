// =============================================================================
// Shared types used across the edge gate core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Commerce state of an item, keyed by its QR code in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagState {
    #[serde(rename = "IN_CART")]
    InCart,
    #[serde(rename = "PAID")]
    Paid,
}

impl std::fmt::Display for TagState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InCart => write!(f, "IN_CART"),
            Self::Paid => write!(f, "PAID"),
        }
    }
}

impl std::str::FromStr for TagState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_CART" => Ok(Self::InCart),
            "PAID" => Ok(Self::Paid),
            other => Err(format!("unknown tag state: {other}")),
        }
    }
}

/// Gate decision outcome for a processed detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "ALARM")]
    Alarm,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Alarm => write!(f, "ALARM"),
        }
    }
}
