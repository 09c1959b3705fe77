//! Bootstrap configuration - seeds runtime state, then runtime owns it.

use serde::{Deserialize, Serialize};

/// Peers dialed once at startup to join an existing mesh.
///
/// Dials are not retried; the mesh grows from inbound connections after that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// `host:port` addresses. Empty entries are ignored.
    #[serde(default)]
    pub peers: Vec<String>,
}

impl BootstrapConfig {
    /// Non-empty, trimmed peer addresses.
    pub fn dialable(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(|p| p.trim()).filter(|p| !p.is_empty())
    }
}
