//! Live peers, keyed by remote address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hoardproto::Peer;

/// Admitted peers. Written by the transport's hooks, read by fan-out.
///
/// Readers never iterate under the lock; they take a [`snapshot`](Self::snapshot).
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<SocketAddr, Arc<dyn Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<dyn Peer>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `peer`, replacing any previous entry for the same address.
    pub fn insert(&self, peer: Arc<dyn Peer>) -> Option<Arc<dyn Peer>> {
        self.lock().insert(peer.remote_addr(), peer)
    }

    /// Remove `peer` only if it is still the entry for its address.
    ///
    /// A reconnect can replace an entry before the old connection's
    /// teardown runs; that teardown must not evict the new one.
    pub fn remove_peer(&self, peer: &Arc<dyn Peer>) -> bool {
        let mut peers = self.lock();
        let addr = peer.remote_addr();
        match peers.get(&addr) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(&addr);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<dyn Peer>> {
        self.lock().get(addr).cloned()
    }

    /// Every peer registered at this instant.
    pub fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.lock().values().cloned().collect()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.addrs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hoardproto::{InboundStream, TransportError};
    use tokio::io::AsyncRead;

    struct FakePeer(SocketAddr);

    #[async_trait]
    impl Peer for FakePeer {
        fn remote_addr(&self) -> SocketAddr {
            self.0
        }

        fn is_outbound(&self) -> bool {
            false
        }

        async fn send(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn recv_exact(&self, _buf: &mut [u8]) -> std::io::Result<()> {
            Ok(())
        }

        async fn send_stream(
            &self,
            _reader: &mut (dyn AsyncRead + Unpin + Send),
        ) -> Result<u64, TransportError> {
            Ok(0)
        }

        async fn open_stream(&self, _size: u64) -> Result<InboundStream, TransportError> {
            Err(TransportError::Stream("fake peer has no stream".into()))
        }

        fn close_stream(&self) {}

        fn close(&self) {}
    }

    fn fake(port: u16) -> Arc<dyn Peer> {
        Arc::new(FakePeer(SocketAddr::from(([127, 0, 0, 1], port))))
    }

    #[test]
    fn test_distinct_addresses() {
        let registry = PeerRegistry::new();
        for port in 4000..4010 {
            assert!(registry.insert(fake(port)).is_none());
        }
        assert_eq!(registry.len(), 10);

        let mut addrs = registry.addrs();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 10);
    }

    #[test]
    fn test_same_address_replaces() {
        let registry = PeerRegistry::new();
        registry.insert(fake(4000));
        assert!(registry.insert(fake(4000)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = PeerRegistry::new();
        let peer = fake(4000);
        let addr = peer.remote_addr();
        registry.insert(peer.clone());

        assert!(registry.remove_peer(&peer));
        assert!(registry.get(&addr).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_teardown_keeps_replacement() {
        let registry = PeerRegistry::new();
        let old = fake(4000);
        let new = fake(4000);
        registry.insert(old.clone());
        registry.insert(new.clone());

        assert!(!registry.remove_peer(&old));
        assert!(registry
            .get(&old.remote_addr())
            .is_some_and(|p| Arc::ptr_eq(&p, &new)));

        assert!(registry.remove_peer(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let registry = PeerRegistry::new();
        let first = fake(4000);
        registry.insert(first.clone());
        registry.insert(fake(4001));

        let snapshot = registry.snapshot();
        registry.insert(fake(4002));
        registry.remove_peer(&first);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_admission() {
        let registry = Arc::new(PeerRegistry::new());

        let handles: Vec<_> = (0..8u16)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..25u16 {
                        registry.insert(fake(5000 + t * 25 + i));
                        let _ = registry.snapshot();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 200);
    }
}
