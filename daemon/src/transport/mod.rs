//! Transport contract.
//!
//! The overlay runs on top of a connection multiplexer providing
//! bidirectional ordered byte streams addressed by peer identity. The
//! multiplexer owns connection security and long-term identities; by the
//! time a stream reaches a [`ProtocolHandler`], the remote address it is
//! labeled with has been cryptographically verified by the transport.
//!
//! The overlay only needs four things from it:
//! - open a fresh outbound stream to a peer for a protocol id
//! - register a handler receiving inbound streams for a protocol id
//! - a feed of peer-identified / peer-disconnected events
//! - the local address, derived from the transport identity bytes as
//!   `base58,` + Base58Btc(identity)
//!
//! [`memory::MemoryNetwork`] implements the contract in-process and backs
//! the test suite.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use veil_common::crypto::Address;

/// Object-safe alias for the byte streams handed out by the transport.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type BoxedStream = Box<dyn StreamIo>;

/// Peer lifecycle events emitted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer identity completed the transport-level handshake.
    PeerIdentified(Address),
    /// A peer connection went away.
    PeerDisconnected(Address),
}

/// Error type for transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer is unknown or offline.
    #[error("Peer is not reachable: {0}")]
    Unreachable(Address),

    /// The remote has no handler for the requested protocol.
    #[error("No handler registered for protocol {0}")]
    NoHandler(String),

    /// The local transport has been shut down.
    #[error("Transport is closed")]
    Closed,

    /// I/O error on a stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiver of inbound streams for one protocol id.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Called once per inbound stream. `remote` is the verified identity
    /// of the peer that opened the stream.
    async fn on_stream(&self, remote: Address, stream: BoxedStream);
}

/// The transport contract required from the collaborator.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address of the local node.
    fn local_address(&self) -> &Address;

    /// Open a fresh outbound stream to `peer` for `protocol`.
    async fn open_stream(
        &self,
        peer: &Address,
        protocol: &str,
    ) -> Result<BoxedStream, TransportError>;

    /// Register the inbound handler for `protocol`, replacing any
    /// previous one.
    async fn register_handler(&self, protocol: &str, handler: Arc<dyn ProtocolHandler>);

    /// Remove the inbound handler for `protocol`.
    async fn unregister_handler(&self, protocol: &str);

    /// Subscribe to peer lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
