#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use veil_daemon::config::NodeConfig;
use veil_daemon::node::Node;
use veil_daemon::transport::memory::MemoryNetwork;

/// Short per-request deadline so negative-path tests finish quickly.
pub const TEST_TIMEOUT_MILLIS: u64 = 300;

pub fn fast_config() -> NodeConfig {
    NodeConfig {
        timeout_millis: TEST_TIMEOUT_MILLIS,
        ..Default::default()
    }
}

pub async fn start_node(network: &Arc<MemoryNetwork>, identity: &[u8]) -> Arc<Node> {
    start_node_with(network, identity, fast_config()).await
}

pub async fn start_node_with(
    network: &Arc<MemoryNetwork>,
    identity: &[u8],
    config: NodeConfig,
) -> Arc<Node> {
    let transport = network.create_transport(identity).await;
    let node = Node::new(config, transport).expect("valid test config");
    node.start().await;
    node
}

/// Pairwise-connect every node, then wait for admissions to settle.
pub async fn connect_all(network: &Arc<MemoryNetwork>, nodes: &[Arc<Node>]) {
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            network.connect(nodes[i].address(), nodes[j].address()).await;
        }
    }
    settle().await;
}

/// Let event-driven admissions and in-flight parcels finish.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

/// Block until the node knows `count` peers, or panic after two seconds.
pub async fn wait_for_peers(node: &Arc<Node>, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if node.known_peers().await.len() >= count {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "node {} knows {} peers, wanted {}",
                node.address(),
                node.known_peers().await.len(),
                count
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
