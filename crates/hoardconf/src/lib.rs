//! Configuration loading for hoard nodes.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): fixed for the life of the process.
//!   Storage root, listen address, logging, network deadlines.
//!
//! - **Bootstrap** (`BootstrapConfig`): peers dialed once at startup.
//!   After that the peer registry is the source of truth.
//!
//! # Usage
//!
//! ```rust,no_run
//! use hoardconf::HoardConfig;
//!
//! let (config, _sources) = HoardConfig::load_with_sources_from(None).expect("Failed to load config");
//!
//! println!("storage: {}", config.infra.paths.storage_root.display());
//! println!("listen: {}", config.infra.bind.listen);
//! for peer in config.bootstrap.dialable() {
//!     println!("bootstrap peer: {}", peer);
//! }
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, per field):
//! 1. `/etc/hoard/config.toml` (system)
//! 2. `~/.config/hoard/config.toml` (user)
//! 3. `./hoard.toml` (local override), or the path given on the command line
//! 4. Environment variables (`HOARD_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! storage_root = "~/.hoard/cas"
//!
//! [bind]
//! listen = "0.0.0.0:3000"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [network]
//! settle_ms = 5
//! fetch_timeout_ms = 5000
//!
//! [bootstrap]
//! peers = ["10.0.0.2:3000"]
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::BootstrapConfig;
pub use infra::{BindConfig, InfraConfig, NetworkConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HoardConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds the peer registry.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl HoardConfig {
    /// Load configuration from all sources and report which ones applied.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/hoard/config.toml`
    /// 3. `~/.config/hoard/config.toml`
    /// 4. `config_path`, or `./hoard.toml` when `None`
    /// 5. Environment variables
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        let mut sources = ConfigSources::default();
        let mut config = Self::merge_files(&files)?;
        sources.files = files;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Merge the given files in order, without looking at the environment.
    pub fn merge_files(files: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in files {
            let table = loader::load_table(path)?;
            loader::merge_tables(&mut merged, table);
        }

        let origin = files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        loader::parse_table(merged, &origin)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Build TOML manually for nicer formatting
        let mut output = String::new();
        let paths = &self.infra.paths;
        let network = &self.infra.network;

        output.push_str("# hoard configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "storage_root = \"{}\"\n",
            paths.storage_root.display()
        ));
        output.push_str(&format!("shard_width = {}\n", paths.shard_width));
        output.push_str(&format!("shard_depth = {}\n", paths.shard_depth));

        output.push_str("\n[bind]\n");
        output.push_str(&format!("listen = \"{}\"\n", self.infra.bind.listen));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output.push_str("\n[network]\n");
        output.push_str(&format!("dial_timeout_ms = {}\n", network.dial_timeout_ms));
        output.push_str(&format!(
            "handshake_timeout_ms = {}\n",
            network.handshake_timeout_ms
        ));
        output.push_str(&format!("send_timeout_ms = {}\n", network.send_timeout_ms));
        output.push_str(&format!(
            "stream_timeout_ms = {}\n",
            network.stream_timeout_ms
        ));
        output.push_str(&format!("fetch_timeout_ms = {}\n", network.fetch_timeout_ms));
        output.push_str(&format!("settle_ms = {}\n", network.settle_ms));
        output.push_str(&format!("max_frame_len = {}\n", network.max_frame_len));
        output.push_str(&format!(
            "max_decode_errors = {}\n",
            network.max_decode_errors
        ));
        output.push_str(&format!("inbound_capacity = {}\n", network.inbound_capacity));

        output.push_str("\n[bootstrap]\n");
        output.push_str("peers = [\n");
        for peer in &self.bootstrap.peers {
            output.push_str(&format!("    \"{}\",\n", peer));
        }
        output.push_str("]\n");

        output
    }
}
