//! Path transforms: key → deterministic location under the objects directory.

use std::path::PathBuf;

use crate::error::StoreError;
use crate::hash::{KeyDigest, DIGEST_HEX_LEN};

/// Relative location of a key: nested directories plus a leaf filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory segments, outermost first.
    pub segments: Vec<String>,
    /// Leaf filename.
    pub filename: String,
}

impl PathKey {
    /// Directory part, relative to the objects root.
    pub fn dir(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Full path relative to the objects root.
    pub fn full_path(&self) -> PathBuf {
        self.dir().join(&self.filename)
    }
}

/// Maps a key to where it lives on disk.
///
/// Implementations must be pure: the same key always yields the same
/// `PathKey` for the lifetime of a store.
pub trait PathTransform: Send + Sync {
    fn transform(&self, key: &str) -> PathKey;
}

/// Shards by key digest: `depth` directories of `width` hex chars each,
/// with the full digest as filename.
///
/// ```text
/// width = 2, depth = 3:  ab/cd/ef/abcdef0123...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardedPathTransform {
    width: usize,
    depth: usize,
}

impl ShardedPathTransform {
    pub const DEFAULT_WIDTH: usize = 2;
    pub const DEFAULT_DEPTH: usize = 3;

    /// Create a transform, rejecting layouts that need more digest than exists.
    pub fn new(width: usize, depth: usize) -> Result<Self, StoreError> {
        if width == 0 || width.saturating_mul(depth) > DIGEST_HEX_LEN {
            return Err(StoreError::InvalidShardLayout { width, depth });
        }
        Ok(Self { width, depth })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Default for ShardedPathTransform {
    fn default() -> Self {
        Self {
            width: Self::DEFAULT_WIDTH,
            depth: Self::DEFAULT_DEPTH,
        }
    }
}

impl PathTransform for ShardedPathTransform {
    fn transform(&self, key: &str) -> PathKey {
        let digest = KeyDigest::of_key(key);
        let segments = digest
            .segments(self.width, self.depth)
            .map(str::to_string)
            .collect();

        PathKey {
            segments,
            filename: digest.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let pk = ShardedPathTransform::default().transform("momsbestpicture");
        assert_eq!(pk.segments.len(), 3);
        assert!(pk.segments.iter().all(|s| s.len() == 2));
        assert_eq!(pk.filename.len(), DIGEST_HEX_LEN);
        assert!(pk.filename.starts_with(&pk.segments.concat()));
    }

    #[test]
    fn test_deterministic() {
        let t = ShardedPathTransform::default();
        assert_eq!(t.transform("k"), t.transform("k"));
    }

    #[test]
    fn test_distinct_keys() {
        let t = ShardedPathTransform::default();
        assert_ne!(t.transform("k1").full_path(), t.transform("k2").full_path());
    }

    #[test]
    fn test_full_digest_split() {
        let t = ShardedPathTransform::new(8, 8).unwrap();
        let pk = t.transform("whole");
        assert_eq!(pk.segments.concat(), pk.filename);
    }

    #[test]
    fn test_zero_depth_is_flat() {
        let t = ShardedPathTransform::new(2, 0).unwrap();
        let pk = t.transform("flat");
        assert!(pk.segments.is_empty());
        assert_eq!(pk.full_path(), PathBuf::from(&pk.filename));
    }

    #[test]
    fn test_rejects_oversized_layout() {
        assert!(matches!(
            ShardedPathTransform::new(8, 9),
            Err(StoreError::InvalidShardLayout { width: 8, depth: 9 })
        ));
        assert!(ShardedPathTransform::new(0, 1).is_err());
    }
}
