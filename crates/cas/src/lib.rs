//! Content-addressable storage for hoard nodes.
//!
//! Blobs are addressed by caller-chosen string keys. A key is never used as
//! a filename; its BLAKE3 digest decides where the blob lives, sharded into
//! nested directories so no single directory grows unbounded.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cas::FileStore;
//!
//! # async fn demo() -> Result<(), cas::StoreError> {
//! let store = FileStore::at_path("/tank/hoard/cas")?;
//!
//! let written = store.write("photos/cat.jpg", &mut &b"meow"[..]).await?;
//! assert!(store.has("photos/cat.jpg").await);
//!
//! let (size, _reader) = store.read("photos/cat.jpg").await?;
//! assert_eq!(size, written);
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod config;
pub mod error;
pub mod hash;
pub mod path;
pub mod store;

pub use cipher::{copy_decrypt, copy_encrypt, EncryptionKey};
pub use config::CasConfig;
pub use error::StoreError;
pub use hash::KeyDigest;
pub use path::{PathKey, PathTransform, ShardedPathTransform};
pub use store::FileStore;
