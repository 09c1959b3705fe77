//! FileServer: replicates a local content store across a mesh of peers.
//!
//! ## Exchanges
//!
//! Storing on one node announces and streams the bytes to every peer:
//!
//! ```text
//! store_data(k, r) ── tee ──▶ local store
//!        │
//!        ├─▶ StoreFile{k, n} to every peer
//!        ├─  settle
//!        └─▶ RAW_STREAM + n bytes to every peer
//! ```
//!
//! A remote get asks everyone and waits for a size-announced answer:
//!
//! ```text
//! get(k) ─▶ GetFile{k} to every peer
//!                     holder ─▶ StoreFile{k, n}, settle, RAW_STREAM + n bytes
//!        ◀─ arrival of k in the local store (or NotFound after fetch_timeout)
//! ```
//!
//! Outbound announce+stream exchanges hold one lock, so every peer sees raw
//! streams in the same order as their announcements.
//!
//! A failed exchange leaves the connection mid-frame or waiting for a stream
//! that will never come. Every peer in that state is closed and forgotten.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use cas::{CasConfig, FileStore};
use hoardconf::HoardConfig;
use hoardproto::{
    codec, InboundRecord, Message, Peer, TcpTransport, Transport, TransportConfig,
    TransportError,
};
use tokio::fs::File;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::registry::PeerRegistry;
use crate::tee::TeeReader;

const ARRIVAL_CAPACITY: usize = 256;

/// Lifecycle of a [`FileServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Started,
    Running,
    Stopped,
}

/// Orchestration settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Addresses dialed once at startup.
    pub bootstrap: Vec<String>,
    /// Deadline for one send to one peer.
    pub send_timeout: Duration,
    /// Deadline for receiving one raw stream into the store.
    pub stream_timeout: Duration,
    /// How long a remote get waits for an answer.
    pub fetch_timeout: Duration,
    /// Pause between an announcement and its raw stream.
    pub settle_delay: Duration,
}

impl ServerConfig {
    pub fn from_config(config: &HoardConfig) -> Self {
        let network = &config.infra.network;
        Self {
            bootstrap: config.bootstrap.dialable().map(str::to_string).collect(),
            send_timeout: network.send_timeout(),
            stream_timeout: network.stream_timeout(),
            fetch_timeout: network.fetch_timeout(),
            settle_delay: network.settle_delay(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&HoardConfig::default())
    }
}

/// A node: local store, peers, and the event loop tying them together.
pub struct FileServer<T: Transport> {
    config: ServerConfig,
    store: FileStore,
    transport: Arc<T>,
    registry: Arc<PeerRegistry>,
    arrivals: broadcast::Sender<String>,
    exchange: Mutex<()>,
    shutdown: CancellationToken,
    state: StdMutex<ServerState>,
    event_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl FileServer<TcpTransport> {
    /// Build a TCP node from loaded configuration.
    pub fn from_config(config: &HoardConfig) -> Result<Arc<Self>, ServerError> {
        let paths = &config.infra.paths;
        let store = FileStore::new(CasConfig {
            shard_width: paths.shard_width,
            shard_depth: paths.shard_depth,
            ..CasConfig::with_base_path(&paths.storage_root)
        })?;

        let shutdown = CancellationToken::new();
        let transport =
            TcpTransport::new(TransportConfig::from_config(config)).with_shutdown(&shutdown);

        Ok(Self::with_shutdown(
            ServerConfig::from_config(config),
            store,
            transport,
            shutdown,
        ))
    }
}

impl<T: Transport> FileServer<T> {
    /// Wire `transport`'s admission and disconnect hooks to a fresh registry.
    pub fn new(config: ServerConfig, store: FileStore, transport: T) -> Arc<Self> {
        Self::with_shutdown(config, store, transport, CancellationToken::new())
    }

    fn with_shutdown(
        config: ServerConfig,
        store: FileStore,
        mut transport: T,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(PeerRegistry::new());

        let admit = registry.clone();
        transport.set_on_peer(Arc::new(
            move |peer: Arc<dyn Peer>| -> Result<(), TransportError> {
                info!(peer = %peer.remote_addr(), outbound = peer.is_outbound(), "peer admitted");
                admit.insert(peer);
                Ok(())
            },
        ));

        let forget = registry.clone();
        transport.set_on_disconnect(Arc::new(move |peer: Arc<dyn Peer>| {
            if forget.remove_peer(&peer) {
                info!(peer = %peer.remote_addr(), "peer removed");
            }
        }));

        let (arrivals, _) = broadcast::channel(ARRIVAL_CAPACITY);

        Arc::new(Self {
            config,
            store,
            transport: Arc::new(transport),
            registry,
            arrivals,
            exchange: Mutex::new(()),
            shutdown,
            state: StdMutex::new(ServerState::Created),
            event_loop: StdMutex::new(None),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn advance(&self, from: ServerState, to: ServerState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    pub fn file_store(&self) -> &FileStore {
        &self.store
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Listen, start the event loop, and dial bootstrap peers.
    ///
    /// Bootstrap failures are logged; they never fail startup.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        if !self.advance(ServerState::Created, ServerState::Started) {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.transport.listen_and_accept().await?;
        let inbound = self.transport.consume().ok_or(ServerError::AlreadyStarted)?;

        let server = Arc::clone(self);
        let handle = tokio::spawn(async move { server.run(inbound).await });
        *self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        self.bootstrap().await;

        self.advance(ServerState::Started, ServerState::Running);
        info!(%addr, peers = self.peer_count(), "📦 node running");
        Ok(addr)
    }

    async fn bootstrap(&self) {
        let mut dials = JoinSet::new();
        for addr in self.config.bootstrap.iter().filter(|a| !a.trim().is_empty()) {
            let transport = Arc::clone(&self.transport);
            let addr = addr.trim().to_string();
            dials.spawn(async move {
                match transport.dial(&addr).await {
                    Ok(remote) => debug!(%remote, "bootstrap peer connected"),
                    Err(e) => warn!(%addr, error = %e, "bootstrap dial failed"),
                }
            });
        }

        while let Some(joined) = dials.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "bootstrap task failed");
            }
        }
    }

    /// Stop the event loop and close every connection.
    pub async fn stop(&self) -> Result<(), ServerError> {
        if self.state() == ServerState::Created {
            return Err(ServerError::NotStarted);
        }

        self.shutdown.cancel();
        self.transport.close();

        let handle = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "event loop ended abnormally");
            }
        }

        self.set_state(ServerState::Stopped);
        info!("node stopped");
        Ok(())
    }

    async fn run(self: Arc<Self>, mut inbound: ReceiverStream<InboundRecord>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = inbound.next() => match next {
                    Some(record) => self.dispatch(record).await,
                    None => break,
                },
            }
        }

        self.transport.close();
        debug!("event loop stopped");
    }

    async fn dispatch(&self, record: InboundRecord) {
        let from = record.from;
        match record.message() {
            Ok(msg) => {
                if let Err(e) = self.handle_message(from, msg).await {
                    warn!(%from, error = %e, "failed to handle message");
                }
            }
            Err(e) => warn!(%from, error = %e, "dropping malformed payload"),
        }
    }

    /// React to one message from the peer at `from`.
    pub async fn handle_message(&self, from: SocketAddr, msg: Message) -> Result<(), ServerError> {
        match msg {
            Message::StoreFile { key, size } => self.receive_file(from, &key, size).await,
            Message::GetFile { key } => self.serve_file(from, &key).await,
        }
    }

    async fn receive_file(&self, from: SocketAddr, key: &str, size: u64) -> Result<(), ServerError> {
        let peer = self
            .registry
            .get(&from)
            .ok_or(ServerError::PeerNotFound(from))?;

        match self.receive_stream(peer.as_ref(), key, size).await {
            Ok(()) => {
                info!(%from, key, size, "stored replica");
                let _ = self.arrivals.send(key.to_string());
                Ok(())
            }
            Err(e) => {
                // The connection is out of step once a raw stream goes wrong.
                peer.close();
                Err(e)
            }
        }
    }

    async fn receive_stream(&self, peer: &dyn Peer, key: &str, size: u64) -> Result<(), ServerError> {
        let mut stream = peer.open_stream(size).await?;

        let written = timeout(self.config.stream_timeout, self.store.write(key, &mut stream))
            .await
            .map_err(|_| ServerError::Timeout {
                operation: "receive stream",
                after: self.config.stream_timeout,
            })??;

        drop(stream);
        peer.close_stream();

        if written != size {
            return Err(ServerError::ShortStream {
                key: key.to_string(),
                expected: size,
                actual: written,
            });
        }
        Ok(())
    }

    async fn serve_file(&self, from: SocketAddr, key: &str) -> Result<(), ServerError> {
        let (size, mut file) = match self.store.read(key).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                debug!(%from, key, "requested key not held");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let peer = self
            .registry
            .get(&from)
            .ok_or(ServerError::PeerNotFound(from))?;
        let announce = frame(&Message::store_file(key, size))?;

        let _exchange = self.exchange.lock().await;
        if let Err(e) = self.announce_and_stream(peer.as_ref(), &announce, &mut file).await {
            self.abandon(&peer, &e);
            return Err(e);
        }

        info!(%from, key, size, "served key");
        Ok(())
    }

    /// Store locally, then replicate to every peer.
    ///
    /// Returns the number of bytes read from `reader`. The first failed send
    /// aborts the remaining fan-out and closes every peer left expecting a
    /// stream; the local copy is kept.
    pub async fn store_data<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut buffer = Vec::new();
        let size = self
            .store
            .write(key, &mut TeeReader::new(reader, &mut buffer))
            .await?;

        let peers = self.registry.snapshot();
        if peers.is_empty() {
            debug!(key, size, "stored locally, no peers");
            return Ok(size);
        }

        let announce = frame(&Message::store_file(key, size))?;

        let _exchange = self.exchange.lock().await;
        for (i, peer) in peers.iter().enumerate() {
            if let Err(e) = self.send_to(peer.as_ref(), &announce).await {
                for announced in &peers[..=i] {
                    self.abandon(announced, &e);
                }
                return Err(e);
            }
        }
        tokio::time::sleep(self.config.settle_delay).await;
        for (i, peer) in peers.iter().enumerate() {
            if let Err(e) = self.stream_to(peer.as_ref(), &mut buffer.as_slice()).await {
                for pending in &peers[i..] {
                    self.abandon(pending, &e);
                }
                return Err(e);
            }
        }

        info!(key, size, peers = peers.len(), "replicated");
        Ok(size)
    }

    /// Store locally only.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        Ok(self.store.write(key, reader).await?)
    }

    /// Read `key`, fetching it from peers if it is not held locally.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        let mut arrivals = self.arrivals.subscribe();

        if self.store.has(key).await {
            return Ok(self.store.read(key).await?);
        }

        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return Err(ServerError::NotFound {
                key: key.to_string(),
            });
        }

        let request = frame(&Message::get_file(key))?;
        for peer in &peers {
            if let Err(e) = self.send_to(peer.as_ref(), &request).await {
                warn!(peer = %peer.remote_addr(), key, error = %e, "get request not delivered");
                self.abandon(peer, &e);
            }
        }
        debug!(key, peers = peers.len(), "fetching from peers");

        let arrived = async {
            loop {
                match arrivals.recv().await {
                    Ok(arrived) if arrived == key => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.store.has(key).await {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };

        match timeout(self.config.fetch_timeout, arrived).await {
            Ok(true) => Ok(self.store.read(key).await?),
            _ => Err(ServerError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn announce_and_stream(
        &self,
        peer: &dyn Peer,
        announce: &[u8],
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, ServerError> {
        self.send_to(peer, announce).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        self.stream_to(peer, reader).await
    }

    /// Close `peer` and drop it from the registry.
    fn abandon(&self, peer: &Arc<dyn Peer>, error: &ServerError) {
        warn!(peer = %peer.remote_addr(), error = %error, "closing peer after failed exchange");
        peer.close();
        self.registry.remove_peer(peer);
    }

    async fn send_to(&self, peer: &dyn Peer, bytes: &[u8]) -> Result<(), ServerError> {
        timeout(self.config.send_timeout, peer.send(bytes))
            .await
            .map_err(|_| ServerError::Timeout {
                operation: "send",
                after: self.config.send_timeout,
            })?
            .map_err(|source| ServerError::Send {
                peer: peer.remote_addr(),
                source,
            })
    }

    async fn stream_to(
        &self,
        peer: &dyn Peer,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64, ServerError> {
        timeout(self.config.send_timeout, peer.send_stream(reader))
            .await
            .map_err(|_| ServerError::Timeout {
                operation: "send stream",
                after: self.config.send_timeout,
            })?
            .map_err(|source| ServerError::Send {
                peer: peer.remote_addr(),
                source,
            })
    }
}

fn frame(msg: &Message) -> Result<Bytes, ServerError> {
    Ok(codec::structured(&msg.encode()?).map_err(TransportError::from)?)
}
