//! Content-addressed hashing primitives
//!
//! Provides [`ContentHash`], the 32-byte Blake3 digest used as the storage key
//! for blobs, and [`Fingerprint`], an incremental builder for the input hashes
//! that identify a stage invocation in the cache.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 32-byte content hash (Blake3)
///
/// Identical bytes always map to the same hash. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wrap raw digest bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Underlying digest bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Build a hash from a byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Digest of arbitrary bytes
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self::new(*blake3::hash(data).as_bytes())
    }

    /// Digest of a UTF-8 string
    #[inline]
    #[must_use]
    pub fn of_str(text: &str) -> Self {
        Self::compute(text.as_bytes())
    }

    /// Full lowercase hex form (64 chars)
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for logs (first 16 hex chars)
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Two-char shard directory used by the blob pool
    #[must_use]
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

// Every store format is JSON, so the hex form is the only one
impl serde::Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = <String as serde::Deserialize>::deserialize(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental builder for input fingerprints
///
/// Callers feed the ingredients of a stage invocation (upstream artifact
/// hashes, prompt text, parameters) as labelled fields. Each field is
/// length-prefixed so `("ab", "c")` and `("a", "bc")` never collide.
///
/// ```rust
/// use reel_artifact::{ContentHash, Fingerprint};
///
/// let upstream = ContentHash::of_str("script-v1");
/// let fp = Fingerprint::new("image")
///     .hash("script", &upstream)
///     .text("style", "watercolor")
///     .finish();
/// assert_ne!(fp, upstream);
/// ```
#[derive(Debug, Clone)]
pub struct Fingerprint {
    hasher: blake3::Hasher,
}

impl Fingerprint {
    /// Start a fingerprint in a domain (usually the stage name)
    #[must_use]
    pub fn new(domain: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        write_field(&mut hasher, b"domain", domain.as_bytes());
        Self { hasher }
    }

    /// Add a text field
    #[must_use]
    pub fn text(mut self, label: &str, value: &str) -> Self {
        write_field(&mut self.hasher, label.as_bytes(), value.as_bytes());
        self
    }

    /// Add a raw byte field
    #[must_use]
    pub fn bytes(mut self, label: &str, value: &[u8]) -> Self {
        write_field(&mut self.hasher, label.as_bytes(), value);
        self
    }

    /// Add another content hash (e.g. an upstream artifact)
    #[must_use]
    pub fn hash(mut self, label: &str, value: &ContentHash) -> Self {
        write_field(&mut self.hasher, label.as_bytes(), value.as_bytes());
        self
    }

    /// Add a serializable parameter block (JSON encoded)
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn json<T: serde::Serialize>(mut self, label: &str, value: &T) -> Result<Self, HashError> {
        let encoded = serde_json::to_vec(value)?;
        write_field(&mut self.hasher, label.as_bytes(), &encoded);
        Ok(self)
    }

    /// Finalize into a content hash
    #[must_use]
    pub fn finish(&self) -> ContentHash {
        ContentHash::new(*self.hasher.finalize().as_bytes())
    }
}

fn write_field(hasher: &mut blake3::Hasher, label: &[u8], value: &[u8]) {
    hasher.update(&(label.len() as u64).to_le_bytes());
    hasher.update(label);
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value);
}

/// Errors that can occur when working with content hashes
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
