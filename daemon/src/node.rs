//! Node lifecycle.
//!
//! A [`Node`] wires the four protocol layers to a transport, reacts to
//! peer lifecycle events, and drives the two background audits. `start`
//! registers the stream handler and spawns the loops; `stop` signals
//! them to exit, unregisters the handler, clears every cache and drains
//! outstanding calls as rejections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::broadcast;

use veil_common::crypto::{Address, Digest};

use crate::config::{
    NodeConfig, AUDIT_JITTER_MILLIS, PROTOCOL_ID, SHAMIR_SHARES, SHAMIR_THRESHOLD,
};
use crate::proto::message::MessageParams;
use crate::proto::swarm::SwarmParams;
use crate::proto::{
    BaseProto, HandshakeProto, MessageEnvelope, MessageProto, ProtoResult, SwarmProto,
};
use crate::transport::{Transport, TransportEvent};

/// Point-in-time sizes of a node's tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub peers: usize,
    pub stored_items: usize,
    pub metadata_owners: usize,
    pub outstanding_calls: usize,
}

/// One overlay node bound to one transport identity.
pub struct Node {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    base: Arc<BaseProto>,
    handshake: Arc<HandshakeProto>,
    swarm: Arc<SwarmProto>,
    message: Arc<MessageProto>,
    running: AtomicBool,
    // Channel to notify the background tasks to exit
    exit: broadcast::Sender<()>,
}

// Interval plus a uniform random jitter, so co-started nodes do not
// audit in lockstep
fn jittered(interval_millis: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=AUDIT_JITTER_MILLIS);
    Duration::from_millis(interval_millis.saturating_add(jitter))
}

impl Node {
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
            .context("invalid node configuration")?;

        let base = BaseProto::new(
            transport.clone(),
            Duration::from_millis(config.timeout_millis),
        );
        let handshake = HandshakeProto::new(
            base.clone(),
            &config.passphrase,
            config.pulse_freshness_millis,
        );
        let swarm = SwarmProto::new(
            handshake.clone(),
            SwarmParams {
                swarm_size: config.swarm_size,
                max_depth: config.max_depth,
                storage_freshness: config.storage_freshness_millis,
                redundancy_margin: config.redundancy_margin,
            },
        );
        let message = MessageProto::new(
            swarm.clone(),
            MessageParams {
                metadata_swarm_size: config.metadata_swarm_size,
                shares: SHAMIR_SHARES,
                threshold: SHAMIR_THRESHOLD,
            },
        );

        let (exit, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            config,
            transport,
            base,
            handshake,
            swarm,
            message,
            running: AtomicBool::new(false),
            exit,
        }))
    }

    pub fn address(&self) -> &Address {
        self.base.local_address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn base(&self) -> &Arc<BaseProto> {
        &self.base
    }

    pub fn handshake(&self) -> &Arc<HandshakeProto> {
        &self.handshake
    }

    pub fn swarm(&self) -> &Arc<SwarmProto> {
        &self.swarm
    }

    pub fn message(&self) -> &Arc<MessageProto> {
        &self.message
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register handlers and spawn the event and audit loops.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Node {} already running", self.address());
            return;
        }
        info!("Starting node {}", self.address());

        self.handshake.register().await;
        self.swarm.register().await;
        self.message.register().await;
        self.transport
            .register_handler(PROTOCOL_ID, self.base.clone())
            .await;

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.event_loop().await;
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.pulse_loop().await;
        });

        let node = Arc::clone(self);
        tokio::spawn(async move {
            node.storage_loop().await;
        });
    }

    /// Stop the loops, unregister, clear every cache and fail the
    /// outstanding calls.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping node {}", self.address());

        let _ = self.exit.send(());
        self.transport.unregister_handler(PROTOCOL_ID).await;
        // Dropping the handler registry also breaks the layer cycles
        self.base.clear_handlers().await;
        self.base.drain_callbacks("Node stopped").await;
        self.base.clear_limiters().await;
        self.handshake.peers().clear().await;
        self.swarm.clear_storage().await;
        self.message.clear_metadata().await;
    }

    // Admit identified peers, forget disconnected ones
    async fn event_loop(self: Arc<Self>) {
        let mut events = self.transport.subscribe();
        let mut exit = self.exit.subscribe();
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                event = events.recv() => match event {
                    Ok(TransportEvent::PeerIdentified(peer)) => {
                        let node = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = node.handshake.admit(&peer).await {
                                debug!("Admission of {} failed: {}", peer, e);
                            }
                        });
                    }
                    Ok(TransportEvent::PeerDisconnected(peer)) => {
                        self.handshake.remove_peer(&peer).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Transport event stream lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!("Event loop of {} exited", self.address());
    }

    async fn pulse_loop(self: Arc<Self>) {
        let mut exit = self.exit.subscribe();
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = tokio::time::sleep(jittered(self.config.pulse_interval_millis)) => {
                    self.handshake.pulse_audit().await;
                }
            }
        }
        debug!("Pulse loop of {} exited", self.address());
    }

    async fn storage_loop(self: Arc<Self>) {
        let mut exit = self.exit.subscribe();
        loop {
            tokio::select! {
                _ = exit.recv() => break,
                _ = tokio::time::sleep(jittered(self.config.storage_audit_interval_millis)) => {
                    self.swarm.storage_audit().await;
                }
            }
        }
        debug!("Storage loop of {} exited", self.address());
    }

    /// Store content on its swarm, returning the content hash.
    pub async fn store(&self, data: &str) -> ProtoResult<Digest> {
        self.swarm.store(data).await
    }

    /// Fetch content by hash.
    pub async fn fetch(&self, hash: &Digest) -> Option<String> {
        self.swarm.fetch(hash).await
    }

    /// The `n` overlay peers nearest to `target`.
    pub async fn nearest_peers(&self, target: &Digest, n: usize) -> Vec<Address> {
        self.swarm.nearest_peers(target, n).await
    }

    /// Send one message.
    pub async fn send_message(&self, recipient: &Address, text: &str) -> ProtoResult<()> {
        self.message.send_message(recipient, text).await
    }

    /// Send a batch of messages with one metadata update per holder.
    pub async fn send_messages(&self, recipient: &Address, texts: &[String]) -> ProtoResult<()> {
        self.message.send_messages(recipient, texts).await
    }

    /// Retrieve the readable inbox of `address`.
    pub async fn get_inbox(&self, address: &Address) -> ProtoResult<Vec<MessageEnvelope>> {
        self.message.get_inbox(address).await
    }

    /// Addresses currently in the peer table.
    pub async fn known_peers(&self) -> Vec<Address> {
        self.handshake.peers().known_peers().await
    }

    /// Snapshot the sizes of the node's tables.
    pub async fn stats(&self) -> NodeStats {
        NodeStats {
            peers: self.handshake.peers().len().await,
            stored_items: self.swarm.stored_items().await,
            metadata_owners: self.message.metadata_owners().await,
            outstanding_calls: self.base.outstanding_calls().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;

    fn test_config() -> NodeConfig {
        NodeConfig {
            timeout_millis: 300,
            ..Default::default()
        }
    }

    async fn test_node(network: &Arc<MemoryNetwork>, identity: &[u8]) -> Arc<Node> {
        let transport = network.create_transport(identity).await;
        let node = Node::new(test_config(), transport).unwrap();
        node.start().await;
        node
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let network = MemoryNetwork::new();
        let transport = network.create_transport(b"node-bad").await;
        let config = NodeConfig {
            passphrase: String::new(),
            ..Default::default()
        };
        assert!(Node::new(config, transport).is_err());
    }

    #[tokio::test]
    async fn test_start_stop_flags() {
        let network = MemoryNetwork::new();
        let node = test_node(&network, b"node-a").await;
        assert!(node.is_running());

        node.stop().await;
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_harmless() {
        let network = MemoryNetwork::new();
        let node = test_node(&network, b"node-a").await;
        node.start().await;
        assert!(node.is_running());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_admission_on_transport_event() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, b"node-a").await;
        let b = test_node(&network, b"node-b").await;

        network.connect(a.address(), b.address()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(a.known_peers().await.contains(b.address()));
        assert!(b.known_peers().await.contains(a.address()));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_evicts_peer() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, b"node-a").await;
        let b = test_node(&network, b"node-b").await;

        network.connect(a.address(), b.address()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.known_peers().await.contains(b.address()));

        network.disconnect(a.address(), b.address()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!a.known_peers().await.contains(b.address()));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_stats_track_tables() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, b"node-a").await;
        let b = test_node(&network, b"node-b").await;

        network.connect(a.address(), b.address()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.store("counted").await.unwrap();

        let stats = a.stats().await;
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.stored_items, 1);
        assert_eq!(stats.outstanding_calls, 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_stop_clears_state() {
        let network = MemoryNetwork::new();
        let a = test_node(&network, b"node-a").await;
        let b = test_node(&network, b"node-b").await;

        network.connect(a.address(), b.address()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.store("ephemeral").await.unwrap();

        a.stop().await;
        assert!(a.known_peers().await.is_empty());
        assert_eq!(a.swarm().stored_items().await, 0);
        assert_eq!(a.base().outstanding_calls().await, 0);

        b.stop().await;
    }
}
