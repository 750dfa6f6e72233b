//! Wallet-client semantic versions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Declared version of a wallet client, e.g. `2.0.4` or `1.1.12.9`.
///
/// Components are compared numerically; missing trailing components count
/// as zero, so `2.0` and `2.0.0` are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientVersion {
    raw: String,
    parts: Vec<u32>,
}

impl ClientVersion {
    /// First release of the 2.x client line.
    pub fn v2_0_0() -> Self {
        Self::from_parts(&[2, 0, 0])
    }

    /// First release accepting anon-score target and red-coin isolation.
    pub fn v2_0_3() -> Self {
        Self::from_parts(&[2, 0, 3])
    }

    /// First release serving wallet-scoped RPC routes.
    pub fn v2_0_4() -> Self {
        Self::from_parts(&[2, 0, 4])
    }

    fn from_parts(parts: &[u32]) -> Self {
        let raw = parts
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Self {
            raw,
            parts: parts.to_vec(),
        }
    }

    /// The version string as declared.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Major version component.
    pub fn major(&self) -> u32 {
        self.parts.first().copied().unwrap_or(0)
    }

    /// Whether the client accepts anon-score target and red-coin isolation.
    pub fn supports_wallet_tuning(&self) -> bool {
        *self >= Self::v2_0_3()
    }

    /// Whether wallet RPC calls go to the wallet-scoped route.
    pub fn uses_wallet_route(&self) -> bool {
        *self >= Self::v2_0_4()
    }

    fn component(&self, idx: usize) -> u32 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl FromStr for ClientVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }
        let parts = trimmed
            .split('.')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| VersionError::InvalidComponent(trimmed.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: trimmed.to_string(),
            parts,
        })
    }
}

impl TryFrom<String> for ClientVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClientVersion> for String {
    fn from(version: ClientVersion) -> Self {
        version.raw
    }
}

impl PartialEq for ClientVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ClientVersion {}

impl PartialOrd for ClientVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Errors parsing a version string.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("Empty version string")]
    Empty,

    #[error("Invalid version component in '{0}'")]
    InvalidComponent(String),
}
