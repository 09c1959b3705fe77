//! TCP transport: listener, dialer and per-connection decode loops.
//!
//! Each connection runs in its own task:
//!
//! ```text
//! accept/dial → handshake → admission hook → decode loop → disconnect hook
//! ```
//!
//! Structured units from every connection land on one bounded channel,
//! handed out once through [`Transport::consume`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use hoardconf::{HoardConfig, NetworkConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, DefaultCodec, Decoder, Unit};
use crate::error::TransportError;
use crate::handshake::{Handshake, NopHandshake};
use crate::message::InboundRecord;
use crate::peer::{Peer, TcpPeer};

/// Called once per connection after the handshake, before any traffic is read.
/// An error rejects the connection.
pub type OnPeer = Arc<dyn Fn(Arc<dyn Peer>) -> Result<(), TransportError> + Send + Sync>;

/// Called once when an admitted connection's task ends, with the peer that
/// was admitted for it.
pub type OnDisconnect = Arc<dyn Fn(Arc<dyn Peer>) + Send + Sync>;

/// Moves units between this node and its peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind the listen address and start accepting. Returns the bound address.
    async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError>;

    /// Connect to `addr`, handshake and admit it. Returns the remote address.
    async fn dial(&self, addr: &str) -> Result<SocketAddr, TransportError>;

    /// The inbound record sequence shared by all connections.
    ///
    /// Yields `Some` exactly once.
    fn consume(&self) -> Option<ReceiverStream<InboundRecord>>;

    /// Stop accepting and tear down every connection.
    fn close(&self);

    fn set_on_peer(&mut self, hook: OnPeer);

    fn set_on_disconnect(&mut self, hook: OnDisconnect);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Settings for a [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub stream_timeout: Duration,
    pub max_frame_len: u32,
    pub max_decode_errors: u32,
    pub inbound_capacity: usize,
}

impl TransportConfig {
    /// Defaults for everything but the listen address.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self::with_network(listen_addr, &NetworkConfig::default())
    }

    pub fn with_network(listen_addr: impl Into<String>, network: &NetworkConfig) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            dial_timeout: network.dial_timeout(),
            handshake_timeout: network.handshake_timeout(),
            stream_timeout: network.stream_timeout(),
            max_frame_len: network.max_frame_len,
            max_decode_errors: network.max_decode_errors,
            inbound_capacity: network.inbound_capacity.max(1),
        }
    }

    pub fn from_config(config: &HoardConfig) -> Self {
        Self::with_network(config.infra.bind.listen.clone(), &config.infra.network)
    }
}

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    config: Arc<TransportConfig>,
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn Decoder>,
    on_peer: Option<OnPeer>,
    on_disconnect: Option<OnDisconnect>,
    inbound_tx: mpsc::Sender<InboundRecord>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<InboundRecord>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let decoder = Arc::new(DefaultCodec::new(config.max_frame_len));

        Self {
            config: Arc::new(config),
            handshake: Arc::new(NopHandshake),
            decoder,
            on_peer: None,
            on_disconnect: None,
            inbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            local_addr: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    /// Replace the [`DefaultCodec`] used by every connection's decode loop.
    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Tie this transport's lifetime to `parent`: cancelling it closes the transport.
    pub fn with_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn connections(&self) -> Connections {
        Connections {
            config: self.config.clone(),
            handshake: self.handshake.clone(),
            decoder: self.decoder.clone(),
            on_peer: self.on_peer.clone(),
            on_disconnect: self.on_disconnect.clone(),
            inbound: self.inbound_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen_and_accept(&self) -> Result<SocketAddr, TransportError> {
        if let Some(addr) = self.local_addr() {
            return Err(TransportError::AlreadyListening(addr));
        }

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;

        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(addr);
        }

        info!(%addr, "listening");
        tokio::spawn(accept_loop(listener, self.connections()));
        Ok(addr)
    }

    async fn dial(&self, addr: &str) -> Result<SocketAddr, TransportError> {
        let stream = match timeout(self.config.dial_timeout, TcpStream::connect(addr)).await {
            Err(_) => return Err(TransportError::timeout("dial", self.config.dial_timeout)),
            Ok(Err(source)) => {
                return Err(TransportError::Dial {
                    addr: addr.to_string(),
                    source,
                })
            }
            Ok(Ok(stream)) => stream,
        };
        let remote = stream.peer_addr()?;

        let connections = self.connections();
        let peer = connections.establish(stream, remote, true).await?;
        debug!(%remote, "dialed peer");

        tokio::spawn(async move { connections.run(peer).await });
        Ok(remote)
    }

    fn consume(&self) -> Option<ReceiverStream<InboundRecord>> {
        self.inbound_rx
            .lock()
            .ok()?
            .take()
            .map(ReceiverStream::new)
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    fn set_on_peer(&mut self, hook: OnPeer) {
        self.on_peer = Some(hook);
    }

    fn set_on_disconnect(&mut self, hook: OnDisconnect) {
        self.on_disconnect = Some(hook);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|slot| *slot)
    }
}

async fn accept_loop(listener: TcpListener, connections: Connections) {
    loop {
        tokio::select! {
            _ = connections.shutdown.cancelled() => {
                debug!("accept loop stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let connections = connections.clone();
                    tokio::spawn(async move {
                        match connections.establish(stream, remote, false).await {
                            Ok(peer) => {
                                debug!(%remote, "accepted peer");
                                connections.run(peer).await;
                            }
                            Err(e) => warn!(%remote, error = %e, "rejected inbound connection"),
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
}

/// Everything a connection task needs, detached from the transport.
#[derive(Clone)]
struct Connections {
    config: Arc<TransportConfig>,
    handshake: Arc<dyn Handshake>,
    decoder: Arc<dyn Decoder>,
    on_peer: Option<OnPeer>,
    on_disconnect: Option<OnDisconnect>,
    inbound: mpsc::Sender<InboundRecord>,
    shutdown: CancellationToken,
}

impl Connections {
    async fn establish(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        outbound: bool,
    ) -> Result<Arc<TcpPeer>, TransportError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%remote, error = %e, "set_nodelay failed");
        }

        let peer = Arc::new(TcpPeer::new(
            stream,
            remote,
            outbound,
            self.shutdown.child_token(),
            self.config.stream_timeout,
        ));

        let admitted = async {
            timeout(
                self.config.handshake_timeout,
                self.handshake.handshake(peer.as_ref()),
            )
            .await
            .map_err(|_| TransportError::timeout("handshake", self.config.handshake_timeout))??;
            peer.finish_handshake();

            if let Some(on_peer) = &self.on_peer {
                on_peer(peer.clone() as Arc<dyn Peer>)?;
            }
            Ok::<(), TransportError>(())
        }
        .await;

        if let Err(e) = admitted {
            peer.close();
            peer.shutdown().await;
            return Err(e);
        }

        Ok(peer)
    }

    async fn run(&self, peer: Arc<TcpPeer>) {
        let remote = peer.remote_addr();

        match self.decode_loop(&peer).await {
            Ok(()) => debug!(%remote, "connection closed"),
            Err(e) => warn!(%remote, error = %e, "connection terminated"),
        }

        peer.close();
        peer.shutdown().await;

        if let Some(on_disconnect) = &self.on_disconnect {
            on_disconnect(peer as Arc<dyn Peer>);
        }
    }

    async fn decode_loop(&self, peer: &TcpPeer) -> Result<(), TransportError> {
        let remote = peer.remote_addr();
        let mut consecutive_errors = 0u32;

        loop {
            let Some(unit) = peer.next_unit(self.decoder.as_ref()).await else {
                return Ok(());
            };

            match unit {
                Ok(Unit::Structured(payload)) => {
                    consecutive_errors = 0;
                    let record = InboundRecord {
                        from: remote,
                        payload,
                    };
                    tokio::select! {
                        _ = peer.cancel_token().cancelled() => return Ok(()),
                        sent = self.inbound.send(record) => {
                            if sent.is_err() {
                                debug!(%remote, "inbound consumer gone");
                                return Ok(());
                            }
                        }
                    }
                }
                Ok(Unit::RawStream) => {
                    consecutive_errors = 0;
                    debug!(%remote, "raw stream incoming");
                    peer.yield_to_consumer().await?;
                }
                Err(CodecError::Closed) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(%remote, error = %e, consecutive_errors, "skipping malformed unit");
                    if consecutive_errors > self.config.max_decode_errors {
                        return Err(e.into());
                    }
                }
            }
        }
    }
}
