//! Store configuration.
//!
//! Default path: `~/.hoard/cas`. Node-level loading lives in `hoardconf`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::path::ShardedPathTransform;

/// Configuration for a content-addressable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasConfig {
    /// Base path for storage.
    /// Objects live in `{base_path}/objects/`, in-flight writes in `{base_path}/staging/`.
    pub base_path: PathBuf,

    /// Read-only mode - prevents any writes.
    #[serde(default)]
    pub read_only: bool,

    /// Hex chars per directory level.
    #[serde(default = "default_shard_width")]
    pub shard_width: usize,

    /// Number of directory levels above each object.
    #[serde(default = "default_shard_depth")]
    pub shard_depth: usize,
}

fn default_shard_width() -> usize {
    ShardedPathTransform::DEFAULT_WIDTH
}

fn default_shard_depth() -> usize {
    ShardedPathTransform::DEFAULT_DEPTH
}

impl Default for CasConfig {
    fn default() -> Self {
        Self::with_base_path(default_cas_path())
    }
}

/// Get the default store path (~/.hoard/cas).
fn default_cas_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".hoard").join("cas"))
        .unwrap_or_else(|| PathBuf::from(".hoard/cas"))
}

impl CasConfig {
    /// Create a config with a specific base path.
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            read_only: false,
            shard_width: default_shard_width(),
            shard_depth: default_shard_depth(),
        }
    }

    /// Create a read-only config with a specific base path.
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::with_base_path(path)
        }
    }

    /// Get the objects directory path.
    pub fn objects_dir(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    /// Get the staging directory path.
    pub fn staging_dir(&self) -> PathBuf {
        self.base_path.join("staging")
    }
}
