//! In-process transport over paired in-memory streams.
//!
//! A [`MemoryNetwork`] is a registry of endpoints addressed like real
//! peers. Opening a stream pairs two halves of a `tokio::io::duplex` and
//! hands the remote half to the destination's protocol handler together
//! with the caller's address, which plays the role of the verified remote
//! identity. Peer discovery is simulated explicitly with
//! [`MemoryNetwork::connect`] / [`disconnect`](MemoryNetwork::disconnect),
//! and node failure with [`crash`](MemoryNetwork::crash).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::trace;
use tokio::sync::{broadcast, RwLock};

use veil_common::crypto::Address;

use super::{BoxedStream, ProtocolHandler, Transport, TransportError, TransportEvent};

/// Buffer size of one in-memory stream half.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of an endpoint's event channel.
const EVENT_CHANNEL_SIZE: usize = 64;

struct Endpoint {
    handlers: RwLock<HashMap<String, Arc<dyn ProtocolHandler>>>,
    events: broadcast::Sender<TransportEvent>,
    online: AtomicBool,
}

impl Endpoint {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            handlers: RwLock::new(HashMap::new()),
            events,
            online: AtomicBool::new(true),
        }
    }

    fn emit(&self, event: TransportEvent) {
        // Nobody listening is fine, events are best-effort
        let _ = self.events.send(event);
    }
}

/// Registry of in-process endpoints.
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<Address, Arc<Endpoint>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new endpoint and return its transport handle.
    ///
    /// The address is derived from `identity` the same way a real
    /// transport derives it from the long-term public key.
    pub async fn create_transport(self: &Arc<Self>, identity: &[u8]) -> Arc<MemoryTransport> {
        let address = Address::from_identity_bytes(identity);
        let endpoint = Arc::new(Endpoint::new());

        let mut nodes = self.nodes.write().await;
        nodes.insert(address.clone(), endpoint.clone());

        Arc::new(MemoryTransport {
            address,
            network: self.clone(),
            endpoint,
        })
    }

    /// Simulate mutual peer discovery between two endpoints.
    pub async fn connect(&self, a: &Address, b: &Address) {
        let nodes = self.nodes.read().await;
        if let (Some(ea), Some(eb)) = (nodes.get(a), nodes.get(b)) {
            ea.emit(TransportEvent::PeerIdentified(b.clone()));
            eb.emit(TransportEvent::PeerIdentified(a.clone()));
        }
    }

    /// Simulate a connection teardown between two endpoints.
    pub async fn disconnect(&self, a: &Address, b: &Address) {
        let nodes = self.nodes.read().await;
        if let Some(ea) = nodes.get(a) {
            ea.emit(TransportEvent::PeerDisconnected(b.clone()));
        }
        if let Some(eb) = nodes.get(b) {
            eb.emit(TransportEvent::PeerDisconnected(a.clone()));
        }
    }

    /// Take an endpoint offline and notify every other endpoint.
    ///
    /// Streams to a crashed endpoint fail with
    /// [`TransportError::Unreachable`] until [`revive`](Self::revive).
    pub async fn crash(&self, address: &Address) {
        let nodes = self.nodes.read().await;
        if let Some(endpoint) = nodes.get(address) {
            endpoint.online.store(false, Ordering::SeqCst);
        }
        for (other, endpoint) in nodes.iter() {
            if other != address {
                endpoint.emit(TransportEvent::PeerDisconnected(address.clone()));
            }
        }
    }

    /// Bring a crashed endpoint back online.
    pub async fn revive(&self, address: &Address) {
        let nodes = self.nodes.read().await;
        if let Some(endpoint) = nodes.get(address) {
            endpoint.online.store(true, Ordering::SeqCst);
        }
    }

    async fn open(
        &self,
        from: &Address,
        to: &Address,
        protocol: &str,
    ) -> Result<BoxedStream, TransportError> {
        let handler = {
            let nodes = self.nodes.read().await;

            let local = nodes
                .get(from)
                .ok_or_else(|| TransportError::Unreachable(from.clone()))?;
            if !local.online.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }

            let remote = nodes
                .get(to)
                .filter(|e| e.online.load(Ordering::SeqCst))
                .ok_or_else(|| TransportError::Unreachable(to.clone()))?;

            let handlers = remote.handlers.read().await;
            handlers
                .get(protocol)
                .cloned()
                .ok_or_else(|| TransportError::NoHandler(protocol.to_owned()))?
        };

        let (local_half, remote_half) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let caller = from.clone();
        trace!("memory stream {} -> {} ({})", from, to, protocol);
        tokio::spawn(async move {
            handler.on_stream(caller, Box::new(remote_half)).await;
        });
        Ok(Box::new(local_half))
    }
}

/// Transport handle of one in-memory endpoint.
pub struct MemoryTransport {
    address: Address,
    network: Arc<MemoryNetwork>,
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> &Address {
        &self.address
    }

    async fn open_stream(
        &self,
        peer: &Address,
        protocol: &str,
    ) -> Result<BoxedStream, TransportError> {
        self.network.open(&self.address, peer, protocol).await
    }

    async fn register_handler(&self, protocol: &str, handler: Arc<dyn ProtocolHandler>) {
        let mut handlers = self.endpoint.handlers.write().await;
        handlers.insert(protocol.to_owned(), handler);
    }

    async fn unregister_handler(&self, protocol: &str) {
        let mut handlers = self.endpoint.handlers.write().await;
        handlers.remove(protocol);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.endpoint.events.subscribe()
    }
}
