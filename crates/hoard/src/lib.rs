//! hoard: a peer-to-peer replicated content store.
//!
//! A [`FileServer`] owns a local [`cas::FileStore`], a transport and the set
//! of live peers. Writes are stored locally and pushed to every peer; reads
//! that miss locally are answered by whichever peer holds the key.
//!
//! ```rust,no_run
//! use hoard::FileServer;
//! use hoardconf::HoardConfig;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let (config, _sources) = HoardConfig::load_with_sources_from(None)?;
//! let server = FileServer::from_config(&config)?;
//! server.start().await?;
//!
//! server.store_data("notes/today", &mut &b"remember the milk"[..]).await?;
//! let (size, _file) = server.get("notes/today").await?;
//! assert_eq!(size, 17);
//!
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod registry;
pub mod server;
pub mod tee;
pub mod telemetry;

pub use error::ServerError;
pub use registry::PeerRegistry;
pub use server::{FileServer, ServerConfig, ServerState};
