//! Content fingerprints for gateway resources.
//!
//! A fingerprint is the lowercase hex SHA-256 of the bytes that describe
//! "everything about a resource that, if changed, must trigger a new
//! deployment". Fingerprints are compared for equality only.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest (64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(self.0.as_str())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a resource from its identity and a secondary attribute.
///
/// The two strings are concatenated byte-exactly with no separator, so
/// `fingerprint("ab", "c") == fingerprint("a", "bc")`. Callers that cannot
/// rule out such collisions should use [`FingerprintBuilder`] instead.
pub fn fingerprint(identity: &str, secondary: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(secondary.as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Incremental fingerprint over length-prefixed fields.
///
/// Every field is written as its byte length (u64, big-endian) followed by
/// the bytes, so distinct field sequences never share an encoding.
#[derive(Default)]
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, value: &str) -> Self {
        self.hasher.update((value.len() as u64).to_be_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.hasher.finalize()))
    }
}
