use serde::{Deserialize, Serialize};
use std::fmt;

use crate::random::RandomSource;

/// Identity of whoever performed an action (a node address or a simulated user).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

/// Synthetic account address on the simulated chain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

/// Free-form action label (`page_visit`, `nft_mint`, ...).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionKind(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BotId(pub String);

/// Free-form metadata attached to an action.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

impl ActionKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActionKind {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&Address> for ActorId {
    fn from(value: &Address) -> Self {
        Self(value.0.clone())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Length of the random suffix in synthetic ids.
pub const SYNTHETIC_SUFFIX_LEN: usize = 9;

/// Builds an id of the form `<prefix>_<timestamp_ms>_<base36 suffix>`.
pub fn synthetic_id(prefix: &str, timestamp_ms: i64, random: &dyn RandomSource) -> String {
    format!(
        "{prefix}_{}_{}",
        timestamp_ms.max(0),
        random.token(SYNTHETIC_SUFFIX_LEN)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn synthetic_id_has_three_segments() {
        let random = SeededRandom::new(7);
        let id = synthetic_id("contract", 1_700_000_000_000, &random);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "contract");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), SYNTHETIC_SUFFIX_LEN);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn blank_address_counts_as_empty() {
        assert!(Address::from("   ").is_empty());
        assert!(!Address::from("node_1").is_empty());
    }
}
