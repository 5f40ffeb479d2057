//! Content addressing for session-type nodes.
//!
//! Every hash-consed node is identified by the SHA-256 digest of its
//! canonical encoding. Children are encoded by their own keys, so two
//! structurally identical subtrees always share a key.

use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::fmt;

/// Trait for hash algorithms used in content addressing.
pub trait Hasher: Clone + Default + PartialEq + Send + Sync + 'static {
    /// Size of the hash output in bytes.
    const HASH_SIZE: usize;

    /// Compute the digest of the input data. Must be deterministic.
    fn digest(data: &[u8]) -> Vec<u8>;

    /// Name of the hash algorithm (for display/debugging).
    fn algorithm_name() -> &'static str;
}

/// SHA-256 hasher, the only algorithm type keys are produced with.
#[derive(Clone, Default, Debug, PartialEq, Eq, Hash)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    const HASH_SIZE: usize = 32;

    fn digest(data: &[u8]) -> Vec<u8> {
        sha2::Sha256::digest(data).to_vec()
    }

    fn algorithm_name() -> &'static str {
        "sha256"
    }
}

/// Identity of a hash-consed session-type node.
///
/// ```
/// use parley_types::TypeKey;
///
/// let a = TypeKey::from_bytes(b"node");
/// let b = TypeKey::from_bytes(b"node");
/// assert_eq!(a, b);
/// assert_eq!(a.to_hex().len(), 64);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeKey(#[serde(with = "hex_bytes")] [u8; 32]);

impl TypeKey {
    /// Create a key by hashing raw bytes.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = Sha256Hasher::digest(data);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    /// Get the raw hash bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to a hexadecimal string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// First eight bytes in hex, enough to tell keys apart in diagnostics.
    #[must_use]
    pub fn short(&self) -> String {
        self.0.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TypeKey<{}>({}...)",
            Sha256Hasher::algorithm_name(),
            self.short()
        )
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        serializer.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(de::Error::custom(format!("type key must be 64 hex digits: {hex}")));
        }
        let mut out = [0u8; 32];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).map_err(de::Error::custom)?;
        }
        Ok(out)
    }
}
