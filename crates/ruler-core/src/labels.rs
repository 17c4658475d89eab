//! Label sets and their stable fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// An ordered label set. Ordering keeps fingerprints and listings stable.
pub type Labels = BTreeMap<String, String>;

const SEPARATOR: u8 = 0xff;

/// Stable 64-bit hash of a label set, part of an alert instance's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Fingerprint a label set. Keys are visited in sorted order, so two equal
    /// sets always hash identically, across processes and restarts.
    pub fn of(labels: &Labels) -> Self {
        let mut hasher = Sha256::new();
        for (name, value) in labels {
            hasher.update(name.as_bytes());
            hasher.update([SEPARATOR]);
            hasher.update(value.as_bytes());
            hasher.update([SEPARATOR]);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|e| crate::Error::Parse(format!("Invalid fingerprint '{}': {}", s, e)))
    }
}

/// Merge `extra` on top of `base`; keys in `extra` win.
pub fn merge(base: &Labels, extra: &Labels) -> Labels {
    let mut merged = base.clone();
    for (k, v) in extra {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let mut a = Labels::new();
        a.insert("job".to_string(), "api".to_string());
        a.insert("instance".to_string(), "host-1".to_string());

        let mut b = Labels::new();
        b.insert("instance".to_string(), "host-1".to_string());
        b.insert("job".to_string(), "api".to_string());

        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_fingerprint_separates_key_value_boundaries() {
        let a = labels(&[("ab", "c")]);
        let b = labels(&[("a", "bc")]);
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_fingerprint_display_roundtrip() {
        let fp = Fingerprint::of(&labels(&[("job", "api")]));
        let text = fp.to_string();
        assert_eq!(text.len(), 16);
        assert_eq!(Fingerprint::from_str(&text).unwrap(), fp);
        assert!(Fingerprint::from_str("not-hex").is_err());
    }

    #[test]
    fn test_merge_prefers_extra() {
        let base = labels(&[("team", "core"), ("severity", "warning")]);
        let extra = labels(&[("severity", "critical")]);
        let merged = merge(&base, &extra);
        assert_eq!(merged.get("severity").unwrap(), "critical");
        assert_eq!(merged.get("team").unwrap(), "core");
    }
}
