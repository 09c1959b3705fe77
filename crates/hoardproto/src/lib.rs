//! Wire protocol and TCP transport for hoard nodes.
//!
//! ## Layers
//!
//! - [`message`]: the closed set of control messages, bincode-encoded.
//! - [`codec`]: one-byte discriminated units, structured or raw stream.
//! - [`peer`]: one connection, with explicit read ownership for raw streams.
//! - [`handshake`]: per-connection gate run before any traffic.
//! - [`transport`]: listener, dialer, decode loops and the inbound sequence.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hoardproto::{codec, Message, TcpTransport, Transport, TransportConfig};
//! use tokio_stream::StreamExt;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpTransport::new(TransportConfig::new("127.0.0.1:0"));
//! let addr = transport.listen_and_accept().await?;
//! println!("listening on {addr}");
//!
//! let mut inbound = transport.consume().expect("first consume");
//! while let Some(record) = inbound.next().await {
//!     match record.message() {
//!         Ok(Message::StoreFile { key, size }) => println!("{key}: {size} bytes incoming"),
//!         Ok(Message::GetFile { key }) => println!("{} wants {key}", record.from),
//!         Err(e) => eprintln!("bad payload: {e}"),
//!     }
//! }
//! # let _ = codec::structured(&[])?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod transport;

pub use codec::{CodecError, Decoder, DefaultCodec, Unit, RAW_STREAM, STRUCTURED};
pub use error::TransportError;
pub use handshake::{Handshake, HandshakeError, NopHandshake};
pub use message::{InboundRecord, Message, MessageError};
pub use peer::{InboundStream, Peer, StreamMode, TcpPeer};
pub use transport::{OnDisconnect, OnPeer, TcpTransport, Transport, TransportConfig};
