//! Per-client privacy policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport policy assigned to a client at provisioning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    /// Plain framing, no carrier.
    #[default]
    Standard,
    /// Obfuscation carrier with size padding.
    SemiGhost,
    /// Obfuscation carrier with larger padding and send jitter.
    FullGhost,
}

impl ClientMode {
    /// Whether the client must use the obfuscation carrier.
    pub fn is_ghost(self) -> bool {
        !matches!(self, ClientMode::Standard)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClientMode::Standard => "standard",
            ClientMode::SemiGhost => "semi_ghost",
            ClientMode::FullGhost => "full_ghost",
        }
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "standard" => Ok(ClientMode::Standard),
            "semi_ghost" => Ok(ClientMode::SemiGhost),
            "full_ghost" | "ghost" => Ok(ClientMode::FullGhost),
            other => Err(format!("unknown client mode: {}", other)),
        }
    }
}
