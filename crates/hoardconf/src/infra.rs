//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Filesystem paths for node state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of this node's content store.
    /// Default: ~/.hoard/cas
    #[serde(default = "PathsConfig::default_storage_root")]
    pub storage_root: PathBuf,

    /// Hex chars per shard directory level.
    /// Default: 2
    #[serde(default = "PathsConfig::default_shard_width")]
    pub shard_width: usize,

    /// Shard directory levels above each object.
    /// Default: 3
    #[serde(default = "PathsConfig::default_shard_depth")]
    pub shard_depth: usize,
}

impl PathsConfig {
    fn default_storage_root() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".hoard/cas"))
            .unwrap_or_else(|| PathBuf::from(".hoard/cas"))
    }

    fn default_shard_width() -> usize {
        2
    }

    fn default_shard_depth() -> usize {
        3
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            storage_root: Self::default_storage_root(),
            shard_width: Self::default_shard_width(),
            shard_depth: Self::default_shard_depth(),
        }
    }
}

/// Network bind address for this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    /// TCP listen address.
    /// Default: 0.0.0.0:3000
    #[serde(default = "BindConfig::default_listen")]
    pub listen: String,
}

impl BindConfig {
    fn default_listen() -> String {
        "0.0.0.0:3000".to_string()
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Deadlines and limits for peer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connect deadline for outbound dials.
    /// Default: 5000
    #[serde(default = "NetworkConfig::default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    /// Deadline for the per-connection handshake.
    /// Default: 5000
    #[serde(default = "NetworkConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Deadline for a single send (message or raw stream) to one peer.
    /// Default: 30000
    #[serde(default = "NetworkConfig::default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// How long either side of a raw stream waits for the other.
    /// Default: 30000
    #[serde(default = "NetworkConfig::default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,

    /// How long a remote get waits for any peer to deliver.
    /// Default: 5000
    #[serde(default = "NetworkConfig::default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Pause between an announcement and the raw bytes it describes.
    /// Default: 5
    #[serde(default = "NetworkConfig::default_settle_ms")]
    pub settle_ms: u64,

    /// Largest structured frame accepted, in bytes.
    /// Default: 65536
    #[serde(default = "NetworkConfig::default_max_frame_len")]
    pub max_frame_len: u32,

    /// Consecutive malformed units tolerated before a connection is dropped.
    /// Default: 8
    #[serde(default = "NetworkConfig::default_max_decode_errors")]
    pub max_decode_errors: u32,

    /// Inbound record queue depth shared by all connections.
    /// Default: 1024
    #[serde(default = "NetworkConfig::default_inbound_capacity")]
    pub inbound_capacity: usize,
}

impl NetworkConfig {
    fn default_dial_timeout_ms() -> u64 {
        5_000
    }

    fn default_handshake_timeout_ms() -> u64 {
        5_000
    }

    fn default_send_timeout_ms() -> u64 {
        30_000
    }

    fn default_stream_timeout_ms() -> u64 {
        30_000
    }

    fn default_fetch_timeout_ms() -> u64 {
        5_000
    }

    fn default_settle_ms() -> u64 {
        5
    }

    fn default_max_frame_len() -> u32 {
        64 * 1024
    }

    fn default_max_decode_errors() -> u32 {
        8
    }

    fn default_inbound_capacity() -> usize {
        1024
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: Self::default_dial_timeout_ms(),
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            send_timeout_ms: Self::default_send_timeout_ms(),
            stream_timeout_ms: Self::default_stream_timeout_ms(),
            fetch_timeout_ms: Self::default_fetch_timeout_ms(),
            settle_ms: Self::default_settle_ms(),
            max_frame_len: Self::default_max_frame_len(),
            max_decode_errors: Self::default_max_decode_errors(),
            inbound_capacity: Self::default_inbound_capacity(),
        }
    }
}

/// Complete infrastructure configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}
