//! FileStore: filesystem-backed content-addressable storage keyed by string.
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── objects/
//! │   └── ab/
//! │       └── cd/
//! │           └── ef/
//! │               └── abcdef0123...  # content, named by full key digest
//! └── staging/
//!     └── 6f1c...                    # in-flight writes (random id)
//! ```
//!
//! Writes land in `staging/` first and are renamed into `objects/` only
//! after the data is synced, so a reader never sees a partial object.
//! Objects are immutable per key: once a key exists, later writes are
//! consumed and discarded.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::config::CasConfig;
use crate::error::StoreError;
use crate::path::{PathTransform, ShardedPathTransform};

/// Filesystem-based content store.
#[derive(Clone)]
pub struct FileStore {
    config: CasConfig,
    transform: Arc<dyn PathTransform>,
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Create a store using the sharded transform described by `config`.
    ///
    /// Creates the objects and staging directories unless read-only.
    pub fn new(config: CasConfig) -> Result<Self, StoreError> {
        let transform = ShardedPathTransform::new(config.shard_width, config.shard_depth)?;
        Self::with_transform(config, Arc::new(transform))
    }

    /// Create a store with a caller-supplied path transform.
    pub fn with_transform(
        config: CasConfig,
        transform: Arc<dyn PathTransform>,
    ) -> Result<Self, StoreError> {
        if !config.read_only {
            let objects = config.objects_dir();
            std::fs::create_dir_all(&objects).map_err(|e| StoreError::io(&objects, e))?;
            let staging = config.staging_dir();
            std::fs::create_dir_all(&staging).map_err(|e| StoreError::io(&staging, e))?;
        }

        Ok(Self { config, transform })
    }

    /// Create a store at a specific path.
    pub fn at_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(CasConfig::with_base_path(path))
    }

    /// Create a read-only store at a specific path.
    pub fn read_only_at(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(CasConfig::read_only(path))
    }

    /// Get the configuration.
    pub fn config(&self) -> &CasConfig {
        &self.config
    }

    /// Path where `key` is or would be stored.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.config
            .objects_dir()
            .join(self.transform.transform(key).full_path())
    }

    /// Check whether `key` has been fully written.
    pub async fn has(&self, key: &str) -> bool {
        fs::try_exists(self.path_for(key)).await.unwrap_or(false)
    }

    /// Stream `reader` to completion into the object for `key`.
    ///
    /// Returns the number of bytes consumed from `reader`. If the key
    /// already exists the bytes are still consumed but the existing object
    /// is kept.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }

        let obj_path = self.path_for(key);
        if let Some(parent) = obj_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let staging_path = self.config.staging_dir().join(Uuid::new_v4().simple().to_string());
        match stage(&staging_path, reader).await {
            Ok(written) => {
                if let Err(e) = seal(&staging_path, &obj_path).await {
                    let _ = fs::remove_file(&staging_path).await;
                    return Err(e);
                }
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&staging_path).await;
                Err(e)
            }
        }
    }

    /// Open the object for `key`, returning its size and a reader.
    pub async fn read(&self, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.path_for(key);
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let size = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(&path, e))?
            .len();

        Ok((size, file))
    }

    /// Read the whole object for `key` into memory.
    pub async fn read_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let (size, mut file) = self.read(key).await?;
        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)
            .await
            .map_err(|e| StoreError::io(self.path_for(key), e))?;
        Ok(data)
    }
}

async fn stage<R>(staging_path: &Path, reader: &mut R) -> Result<u64, StoreError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = File::create(staging_path)
        .await
        .map_err(|e| StoreError::io(staging_path, e))?;

    let written = tokio::io::copy(reader, &mut file)
        .await
        .map_err(|e| StoreError::io(staging_path, e))?;

    file.sync_all()
        .await
        .map_err(|e| StoreError::io(staging_path, e))?;

    Ok(written)
}

async fn seal(staging_path: &Path, obj_path: &Path) -> Result<(), StoreError> {
    let exists = fs::try_exists(obj_path)
        .await
        .map_err(|e| StoreError::io(obj_path, e))?;

    if exists {
        // Immutable per key: first sealed write wins.
        fs::remove_file(staging_path)
            .await
            .map_err(|e| StoreError::io(staging_path, e))
    } else {
        fs::rename(staging_path, obj_path)
            .await
            .map_err(|e| StoreError::io(obj_path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathKey;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let data = b"some jpg bytes";
        let n = store.write("momsbestpicture", &mut &data[..]).await?;
        assert_eq!(n, data.len() as u64);

        let (size, mut file) = store.read("momsbestpicture").await?;
        assert_eq!(size, data.len() as u64);
        let mut read_back = Vec::new();
        file.read_to_end(&mut read_back).await?;
        assert_eq!(read_back, data);

        Ok(())
    }

    #[tokio::test]
    async fn test_has_before_and_after_write() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        assert!(!store.has("k").await);
        store.write("k", &mut &b"v"[..]).await?;
        assert!(store.has("k").await);

        Ok(())
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let err = store.read("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, StoreError::NotFound { ref key } if key == "nope"));

        Ok(())
    }

    #[tokio::test]
    async fn test_empty_content() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        assert_eq!(store.write("empty", &mut &b""[..]).await?, 0);
        assert!(store.has("empty").await);
        assert!(store.read_bytes("empty").await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_path_layout() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        store.write("layout", &mut &b"x"[..]).await?;
        let path = store.path_for("layout");

        let rel = path.strip_prefix(store.config().objects_dir())?;
        let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().to_string()).collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].len(), 64);
        assert!(parts[3].starts_with(&format!("{}{}{}", parts[0], parts[1], parts[2])));
        assert!(path.exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_first_write_wins() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        store.write("same", &mut &b"first"[..]).await?;
        let consumed = store.write("same", &mut &b"second!"[..]).await?;
        assert_eq!(consumed, 7);
        assert_eq!(store.read_bytes("same").await?, b"first");

        Ok(())
    }

    #[tokio::test]
    async fn test_staging_is_cleaned_up() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        store.write("a", &mut &b"1"[..]).await?;
        store.write("a", &mut &b"2"[..]).await?;

        let leftovers = std::fs::read_dir(store.config().staging_dir())?.count();
        assert_eq!(leftovers, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_prevents_writes() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::read_only_at(temp_dir.path())?;

        let result = store.write("k", &mut &b"should fail"[..]).await;
        assert!(matches!(result, Err(StoreError::ReadOnly)));

        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_allows_reads() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;

        let writable = FileStore::at_path(temp_dir.path())?;
        writable.write("k", &mut &b"readable content"[..]).await?;

        let readonly = FileStore::read_only_at(temp_dir.path())?;
        assert_eq!(readonly.read_bytes("k").await?, b"readable content");

        Ok(())
    }

    #[tokio::test]
    async fn test_custom_transform() -> anyhow::Result<()> {
        struct Flat;
        impl PathTransform for Flat {
            fn transform(&self, key: &str) -> PathKey {
                PathKey {
                    segments: vec!["flat".to_string()],
                    filename: key.to_string(),
                }
            }
        }

        let temp_dir = TempDir::new()?;
        let store = FileStore::with_transform(
            CasConfig::with_base_path(temp_dir.path()),
            Arc::new(Flat),
        )?;

        store.write("plain", &mut &b"x"[..]).await?;
        assert!(temp_dir.path().join("objects/flat/plain").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_key() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let mut handles = vec![];
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write("shared", &mut &b"Concurrent Data"[..]).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await??, 15);
        }

        assert_eq!(store.read_bytes("shared").await?, b"Concurrent Data");
        Ok(())
    }

    #[tokio::test]
    async fn test_large_object() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let store = FileStore::at_path(temp_dir.path())?;

        let data: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let n = store.write("big", &mut data.as_slice()).await?;
        assert_eq!(n, data.len() as u64);
        assert_eq!(store.read_bytes("big").await?, data);

        Ok(())
    }
}
