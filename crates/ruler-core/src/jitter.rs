//! Deterministic evaluation jitter
//!
//! Spreads rules that share an interval across the ticks of that interval.
//! The offset depends only on rule identity, so a restart keeps every rule
//! on the tick it used before.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::rule::AlertRule;

/// How evaluation offsets are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Every rule evaluates on offset 0
    #[default]
    Never,
    /// Rules of the same group share an offset
    ByGroup,
    /// Every rule gets its own offset
    ByRule,
}

impl JitterStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::ByGroup => "by_group",
            Self::ByRule => "by_rule",
        }
    }
}

impl std::str::FromStr for JitterStrategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "never" | "" => Ok(Self::Never),
            "by_group" | "bygroup" => Ok(Self::ByGroup),
            "by_rule" | "byrule" => Ok(Self::ByRule),
            _ => Err(crate::Error::Config(format!("Unknown jitter strategy: {}", s))),
        }
    }
}

/// Tick offset of `rule` within its interval, always in `0..ticks_per_interval`
pub fn jitter_offset_in_ticks(
    rule: &AlertRule,
    base_interval_seconds: i64,
    strategy: JitterStrategy,
) -> i64 {
    let frequency = rule.ticks_per_interval(base_interval_seconds);
    let hash = match strategy {
        JitterStrategy::Never => return 0,
        JitterStrategy::ByGroup => jitter_hash(&[
            rule.rule_group.as_bytes(),
            rule.namespace_uid.as_bytes(),
            &rule.org_id.to_be_bytes(),
        ]),
        JitterStrategy::ByRule => jitter_hash(&[
            rule.rule_group.as_bytes(),
            rule.namespace_uid.as_bytes(),
            &rule.org_id.to_be_bytes(),
            rule.uid.as_bytes(),
        ]),
    };
    let offset = (hash % frequency as u64) as i64;
    offset.max(0)
}

fn jitter_hash(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
