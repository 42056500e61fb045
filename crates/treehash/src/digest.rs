use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Error returned when a hex string is not a valid 32-byte digest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tree hash {value:?}: {reason}")]
pub struct ParseTreeHashError {
    pub value: String,
    pub reason: String,
}

/// A SHA-256 digest, either of a single block or a tree root.
///
/// Serialized as 64 lowercase hex characters, which is how the remote
/// service reports fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHash([u8; 32]);

impl TreeHash {
    /// Wraps raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Parent node of two children: `SHA-256(left || right)`.
    pub fn pair(left: &TreeHash, right: &TreeHash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", self.to_hex())
    }
}

impl FromStr for TreeHash {
    type Err = ParseTreeHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|e| ParseTreeHashError {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for TreeHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TreeHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn of_matches_known_digest() {
        assert_eq!(TreeHash::of(b"").to_hex(), EMPTY_SHA256);
        assert_eq!(
            TreeHash::of(b"hello world").to_string(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn parse_accepts_upper_and_lower_case() {
        let lower: TreeHash = EMPTY_SHA256.parse().unwrap();
        let upper: TreeHash = EMPTY_SHA256.to_uppercase().parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, TreeHash::of(b""));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("abc".parse::<TreeHash>().is_err());
        assert!("zz".repeat(32).parse::<TreeHash>().is_err());
        assert!("00".repeat(33).parse::<TreeHash>().is_err());
    }

    #[test]
    fn pair_is_order_sensitive() {
        let a = TreeHash::of(b"a");
        let b = TreeHash::of(b"b");
        assert_ne!(TreeHash::pair(&a, &b), TreeHash::pair(&b, &a));

        let mut concat = Vec::new();
        concat.extend_from_slice(a.as_bytes());
        concat.extend_from_slice(b.as_bytes());
        assert_eq!(TreeHash::pair(&a, &b), TreeHash::of(&concat));
    }

    #[test]
    fn serde_uses_hex_string() {
        let hash = TreeHash::of(b"");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{EMPTY_SHA256}\""));
        let parsed: TreeHash = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, hash);
        assert!(serde_json::from_str::<TreeHash>("\"nothex\"").is_err());
    }
}
