//! KeyDigest: the BLAKE3 digest of a storage key (64 hex chars).
//!
//! Keys are arbitrary strings chosen by callers, so they never touch the
//! filesystem directly. The digest is what decides where content lives.

use std::fmt;

/// Length of a hex-encoded digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// A full BLAKE3 digest of a key, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyDigest(String);

impl KeyDigest {
    /// Digest a key.
    pub fn of_key(key: &str) -> Self {
        let hash = blake3::hash(key.as_bytes());
        Self(hex::encode(hash.as_bytes()))
    }

    /// Split the leading `depth` segments of `width` chars each.
    ///
    /// Callers validate `width * depth <= DIGEST_HEX_LEN` up front.
    pub fn segments(&self, width: usize, depth: usize) -> impl Iterator<Item = &str> {
        (0..depth).map(move |i| &self.0[i * width..(i + 1) * width])
    }

    /// Get the full digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
