//! SwarmProto: proximity lookup, content store/fetch, storage audit.
//!
//! Content lives at `Blake2b(content)` and peers at `Blake2b(address)` in
//! one 256-bit keyspace ordered by XOR popcount distance. A store places
//! a fragment on the `swarm_size` peers nearest its hash; a fetch asks
//! the locally-nearest candidates and keeps the first fragment whose
//! hash verifies. A background audit re-checks the swarm of every stale
//! item (plus the freshest items this node is most responsible for) and
//! re-stores the fragment wherever it has gone missing, which converges
//! replication without any global view.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexSet;
use log::{debug, trace, warn};
use lru::LruCache;
use metrics::counter;
use tokio::sync::Mutex;

use veil_common::crypto::distance::xor_distance;
use veil_common::crypto::hash::blake2b;
use veil_common::crypto::{Address, Digest};
use veil_common::time::{now_millis, UnixMillis};

use crate::config::{MAX_NEAREST_FANOUT, STORAGE_CAPACITY};

use super::base::RequestHandler;
use super::error::{ProtoError, ProtoResult};
use super::handshake::HandshakeProto;
use super::parcel::{Request, RequestKind, ResponseData};

// Compile-time validation that the storage capacity is non-zero
const _: () = assert!(STORAGE_CAPACITY > 0, "STORAGE_CAPACITY must be non-zero");

/// One locally held fragment.
#[derive(Debug, Clone)]
pub struct StorageItem {
    pub data: String,
    pub created_at: UnixMillis,
}

/// Parameters of the swarm layer, lifted from the node configuration.
#[derive(Debug, Clone)]
pub struct SwarmParams {
    pub swarm_size: usize,
    pub max_depth: usize,
    pub storage_freshness: UnixMillis,
    pub redundancy_margin: usize,
}

/// The proximity and storage layer.
pub struct SwarmProto {
    handshake: Arc<HandshakeProto>,
    storage: Mutex<LruCache<Digest, StorageItem>>,
    params: SwarmParams,
}

// Order candidates by distance to the target, closest first. The sort is
// stable, equal distances keep their input order.
fn rank(target: &Digest, mut candidates: Vec<Address>, n: usize) -> Vec<Address> {
    candidates.sort_by_cached_key(|address| xor_distance(target, &address.position()));
    candidates.truncate(n);
    candidates
}

impl SwarmProto {
    pub fn new(handshake: Arc<HandshakeProto>, params: SwarmParams) -> Arc<Self> {
        Arc::new(Self {
            handshake,
            storage: Mutex::new(LruCache::new(
                // SAFETY: Compile-time assertion above guarantees STORAGE_CAPACITY > 0
                unsafe { NonZeroUsize::new_unchecked(STORAGE_CAPACITY) },
            )),
            params,
        })
    }

    /// Register the swarm request handlers with the base.
    pub async fn register(self: &Arc<Self>) {
        let handler: Arc<dyn RequestHandler> = Arc::new(SwarmHandler {
            proto: self.clone(),
        });
        let base = self.handshake.base();
        base.register_handler(RequestKind::NearestPeers, handler.clone())
            .await;
        base.register_handler(RequestKind::Store, handler.clone())
            .await;
        base.register_handler(RequestKind::Fetch, handler).await;
    }

    pub fn handshake(&self) -> &Arc<HandshakeProto> {
        &self.handshake
    }

    pub fn local_address(&self) -> &Address {
        self.handshake.local_address()
    }

    pub fn params(&self) -> &SwarmParams {
        &self.params
    }

    /// The `n` locally-known candidates nearest to `target`. Self is
    /// always a candidate.
    pub async fn local_nearest(&self, target: &Digest, n: usize) -> Vec<Address> {
        let mut candidates = self.handshake.peers().known_peers().await;
        candidates.push(self.local_address().clone());
        rank(target, candidates, n)
    }

    // Ask one candidate for its nearest peers. Self is answered locally
    // without a network round-trip.
    async fn query_nearest(
        &self,
        peer: &Address,
        target: &Digest,
        n: usize,
    ) -> ProtoResult<Vec<Address>> {
        if peer == self.local_address() {
            return Ok(self.local_nearest(target, n).await);
        }
        let request = Request::NearestPeers {
            n,
            hash: target.clone(),
            stamp: None,
        };
        match self.handshake.send_stamped(peer, request).await? {
            ResponseData::NearestPeers { peers } => Ok(peers),
            _ => Err(ProtoError::UnexpectedResponse),
        }
    }

    /// Iterative proximity lookup: the `n` peers of the overlay nearest
    /// to `target`, converging in at most `max_depth` rounds.
    pub async fn nearest_peers(&self, target: &Digest, n: usize) -> Vec<Address> {
        let mut pool: IndexSet<Address> =
            self.local_nearest(target, n).await.into_iter().collect();
        let mut frontier: Vec<Address> = pool.iter().cloned().collect();
        let mut best = match frontier.first() {
            Some(address) => xor_distance(target, &address.position()),
            None => u32::MAX,
        };

        for round in 0..self.params.max_depth {
            let queries = frontier
                .iter()
                .map(|peer| self.query_nearest(peer, target, n));
            let results = join_all(queries).await;

            for result in results {
                match result {
                    Ok(peers) => {
                        pool.extend(peers);
                    }
                    Err(e) => debug!("Nearest-peers query failed: {}", e),
                }
            }

            frontier = rank(target, pool.iter().cloned().collect(), n);
            let improved = match frontier.first() {
                Some(address) => xor_distance(target, &address.position()),
                None => u32::MAX,
            };
            trace!(
                "Lookup round {}: best distance {} -> {}",
                round,
                best,
                improved
            );
            if frontier.is_empty() || improved >= best {
                break;
            }
            best = improved;
        }
        frontier
    }

    /// Store a fragment on the swarm of its hash. Single-holder failures
    /// degrade replication, they never fail the call.
    pub async fn store(&self, data: &str) -> ProtoResult<Digest> {
        let hash = blake2b(data.as_bytes());
        let swarm = self.nearest_peers(&hash, self.params.swarm_size).await;
        trace!("Storing {} on {} holders", hash, swarm.len());

        let stores = swarm.iter().map(|peer| self.store_at(peer, &hash, data));
        let results = join_all(stores).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        counter!("veil_fragments_stored").increment(delivered as u64);
        if delivered == 0 {
            warn!("Store of {} reached no holders", hash);
        }
        Ok(hash)
    }

    // Place one fragment with one holder; self saves locally
    async fn store_at(&self, peer: &Address, hash: &Digest, data: &str) -> ProtoResult<()> {
        if peer == self.local_address() {
            self.save_local(hash.clone(), data.to_owned()).await;
            return Ok(());
        }
        let request = Request::Store {
            data: data.to_owned(),
            stamp: None,
        };
        match self.handshake.send_stamped(peer, request).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("Store at {} failed: {}", peer, e);
                Err(e)
            }
        }
    }

    /// Fetch a fragment by hash from the locally-nearest candidates.
    /// Returns the first copy whose hash verifies, or `None`.
    pub async fn fetch(&self, hash: &Digest) -> Option<String> {
        let holders = self.local_nearest(hash, self.params.swarm_size).await;
        let fetches = holders.iter().map(|peer| self.fetch_from(peer, hash));
        let results = join_all(fetches).await;
        results.into_iter().flatten().next()
    }

    // Fetch one candidate's copy, verifying integrity before use
    async fn fetch_from(&self, peer: &Address, hash: &Digest) -> Option<String> {
        let fragment = if peer == self.local_address() {
            self.local_fragment(hash).await
        } else {
            let request = Request::Fetch {
                hash: hash.clone(),
                stamp: None,
            };
            match self.handshake.send_stamped(peer, request).await {
                Ok(ResponseData::Fetch { fragment }) => fragment,
                Ok(_) => None,
                Err(e) => {
                    debug!("Fetch of {} from {} failed: {}", hash, peer, e);
                    None
                }
            }
        };
        // Discard fragments whose hash does not match
        fragment.filter(|data| blake2b(data.as_bytes()) == *hash)
    }

    /// Insert a fragment into local storage under its hash.
    pub async fn save_local(&self, hash: Digest, data: String) {
        let mut storage = self.storage.lock().await;
        storage.put(
            hash,
            StorageItem {
                data,
                created_at: now_millis(),
            },
        );
    }

    /// Read a fragment from local storage.
    pub async fn local_fragment(&self, hash: &Digest) -> Option<String> {
        let mut storage = self.storage.lock().await;
        storage.get(hash).map(|item| item.data.clone())
    }

    /// Number of locally held fragments.
    pub async fn stored_items(&self) -> usize {
        self.storage.lock().await.len()
    }

    pub async fn clear_storage(&self) {
        self.storage.lock().await.clear();
    }

    /// One storage audit cycle.
    ///
    /// Audits every stale item plus up to `redundancy_margin` fresh items
    /// by smallest self-distance (the items this node is most responsible
    /// for), re-storing the fragment on any swarm member that cannot
    /// produce a valid copy.
    pub async fn storage_audit(&self) {
        let self_position = self.local_address().position();
        let now = now_millis();

        let mut stale: Vec<(Digest, String)> = Vec::new();
        let mut fresh: Vec<(Digest, String)> = Vec::new();
        {
            let storage = self.storage.lock().await;
            for (hash, item) in storage.iter() {
                let age = now.saturating_sub(item.created_at);
                if age > self.params.storage_freshness {
                    stale.push((hash.clone(), item.data.clone()));
                } else {
                    fresh.push((hash.clone(), item.data.clone()));
                }
            }
        }

        fresh.sort_by_cached_key(|(hash, _)| xor_distance(&self_position, hash));
        fresh.truncate(self.params.redundancy_margin);

        if stale.is_empty() && fresh.is_empty() {
            return;
        }
        debug!(
            "Storage audit: {} stale, {} fresh items",
            stale.len(),
            fresh.len()
        );

        for (hash, data) in &stale {
            self.audit_item(hash, data).await;
            // The item was just re-replicated, treat it as fresh again
            let mut storage = self.storage.lock().await;
            if let Some(item) = storage.get_mut(hash) {
                item.created_at = now_millis();
            }
        }
        for (hash, data) in &fresh {
            self.audit_item(hash, data).await;
        }
    }

    // Verify one item's swarm and repair the holders that lost it
    async fn audit_item(&self, hash: &Digest, data: &str) {
        let swarm = self.local_nearest(hash, self.params.swarm_size).await;
        let checks = swarm
            .iter()
            .map(|peer| async move { (peer, self.fetch_from(peer, hash).await) });
        let results = join_all(checks).await;

        for (peer, copy) in results {
            if copy.is_none() {
                trace!("Repairing {} on {}", hash, peer);
                counter!("veil_audit_repairs").increment(1);
                let _ = self.store_at(peer, hash, data).await;
            }
        }
    }
}

struct SwarmHandler {
    proto: Arc<SwarmProto>,
}

#[async_trait]
impl RequestHandler for SwarmHandler {
    async fn handle(
        &self,
        sender: &Address,
        request: Request,
    ) -> anyhow::Result<Option<ResponseData>> {
        if !self.proto.handshake.verify_stamp(&request) {
            warn!("Invalid stamp on {} from {}", request.kind(), sender);
            return Ok(None);
        }
        match request {
            Request::NearestPeers { n, hash, .. } => {
                let n = n.min(MAX_NEAREST_FANOUT);
                let peers = self.proto.local_nearest(&hash, n).await;
                Ok(Some(ResponseData::NearestPeers { peers }))
            }
            Request::Store { data, .. } => {
                let hash = blake2b(data.as_bytes());
                self.proto.save_local(hash, data).await;
                Ok(Some(ResponseData::Empty))
            }
            Request::Fetch { hash, .. } => {
                let fragment = self.proto.local_fragment(&hash).await;
                Ok(Some(ResponseData::Fetch { fragment }))
            }
            other => anyhow::bail!("unexpected request {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PROTOCOL_ID, SWARM_SIZE};
    use crate::proto::base::BaseProto;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::Transport;
    use std::time::Duration;

    const TEST_TIMEOUT: Duration = Duration::from_millis(200);
    const PASSPHRASE: &str = "a quiet word between peers";

    fn test_params() -> SwarmParams {
        SwarmParams {
            swarm_size: SWARM_SIZE,
            max_depth: 5,
            storage_freshness: 180_000,
            redundancy_margin: 10,
        }
    }

    async fn swarm_node(network: &Arc<MemoryNetwork>, identity: &[u8]) -> Arc<SwarmProto> {
        let transport = network.create_transport(identity).await;
        let base = BaseProto::new(transport.clone(), TEST_TIMEOUT);
        transport.register_handler(PROTOCOL_ID, base.clone()).await;
        let handshake = HandshakeProto::new(base, PASSPHRASE, 60_000);
        handshake.register().await;
        let swarm = SwarmProto::new(handshake, test_params());
        swarm.register().await;
        swarm
    }

    async fn admit_mesh(nodes: &[Arc<SwarmProto>]) {
        for a in nodes {
            for b in nodes {
                if a.local_address() != b.local_address() {
                    a.handshake().admit(b.local_address()).await.unwrap();
                }
            }
        }
    }

    #[test]
    fn test_rank_orders_and_truncates() {
        let target = blake2b(b"somewhere");
        let candidates: Vec<Address> = (0..20u8)
            .map(|n| Address::from_identity_bytes(&[n; 4]))
            .collect();

        let ranked = rank(&target, candidates.clone(), 5);
        assert_eq!(ranked.len(), 5);
        for window in ranked.windows(2) {
            assert!(
                xor_distance(&target, &window[0].position())
                    <= xor_distance(&target, &window[1].position())
            );
        }

        // Without truncation the ranking is a permutation of the input
        let full = rank(&target, candidates.clone(), usize::MAX);
        assert_eq!(full.len(), candidates.len());
        for candidate in &candidates {
            assert!(full.contains(candidate));
        }
    }

    #[tokio::test]
    async fn test_local_nearest_includes_self_and_ranks() {
        let network = MemoryNetwork::new();
        let node = swarm_node(&network, b"swarm-solo").await;

        let target = blake2b(b"somewhere");
        let nearest = node.local_nearest(&target, 3).await;
        assert_eq!(nearest, vec![node.local_address().clone()]);
    }

    #[tokio::test]
    async fn test_local_nearest_orders_by_distance() {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::new();
        for n in 0u8..6 {
            nodes.push(swarm_node(&network, &[n; 12]).await);
        }
        admit_mesh(&nodes).await;

        let target = blake2b(b"banana");
        let nearest = nodes[0].local_nearest(&target, 6).await;
        assert_eq!(nearest.len(), 6);

        let distances: Vec<u32> = nearest
            .iter()
            .map(|a| xor_distance(&target, &a.position()))
            .collect();
        let mut sorted = distances.clone();
        sorted.sort_unstable();
        assert_eq!(distances, sorted);
    }

    #[tokio::test]
    async fn test_store_and_fetch_two_nodes() {
        let network = MemoryNetwork::new();
        let a = swarm_node(&network, b"swarm-a").await;
        let b = swarm_node(&network, b"swarm-b").await;
        admit_mesh(&[a.clone(), b.clone()]).await;

        let hash = a.store("hello").await.unwrap();
        assert_eq!(hash, blake2b(b"hello"));

        let fetched = b.fetch(&hash).await;
        assert_eq!(fetched, Some("hello".to_owned()));
    }

    #[tokio::test]
    async fn test_fetch_missing_is_none() {
        let network = MemoryNetwork::new();
        let a = swarm_node(&network, b"swarm-a").await;
        let b = swarm_node(&network, b"swarm-b").await;
        admit_mesh(&[a.clone(), b.clone()]).await;

        assert_eq!(a.fetch(&blake2b(b"never stored")).await, None);
    }

    #[tokio::test]
    async fn test_fetch_discards_corrupt_fragment() {
        let network = MemoryNetwork::new();
        let a = swarm_node(&network, b"swarm-a").await;
        let b = swarm_node(&network, b"swarm-b").await;
        admit_mesh(&[a.clone(), b.clone()]).await;

        // Poison b's storage under the hash of other content
        let hash = blake2b(b"the real thing");
        b.save_local(hash.clone(), "forged".to_owned()).await;

        assert_eq!(a.fetch(&hash).await, None);
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let network = MemoryNetwork::new();
        let a = swarm_node(&network, b"swarm-a").await;
        let b = swarm_node(&network, b"swarm-b").await;
        admit_mesh(&[a.clone(), b.clone()]).await;

        let first = a.store("same bytes").await.unwrap();
        let second = a.store("same bytes").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_nearest_peers_terminates_without_peers() {
        let network = MemoryNetwork::new();
        let node = swarm_node(&network, b"swarm-solo").await;

        let found = node.nearest_peers(&blake2b(b"target"), 3).await;
        assert_eq!(found, vec![node.local_address().clone()]);
    }

    #[tokio::test]
    async fn test_audit_repairs_lost_fragment() {
        let network = MemoryNetwork::new();
        let a = swarm_node(&network, b"swarm-a").await;
        let b = swarm_node(&network, b"swarm-b").await;
        let c = swarm_node(&network, b"swarm-c").await;
        let nodes = [a.clone(), b.clone(), c.clone()];
        admit_mesh(&nodes).await;

        let hash = a.store("precious").await.unwrap();

        // With three nodes and swarm size 3, everyone holds the item
        for node in &nodes {
            assert_eq!(
                node.local_fragment(&hash).await,
                Some("precious".to_owned()),
                "holder {}",
                node.local_address()
            );
        }

        // One holder loses its storage; a's audit puts the copy back
        b.clear_storage().await;
        assert_eq!(b.local_fragment(&hash).await, None);

        a.storage_audit().await;
        assert_eq!(b.local_fragment(&hash).await, Some("precious".to_owned()));
    }

    #[tokio::test]
    async fn test_stale_items_refreshed_by_audit() {
        let network = MemoryNetwork::new();
        let params = SwarmParams {
            storage_freshness: 0,
            ..test_params()
        };
        let transport = network.create_transport(b"swarm-a").await;
        let base = BaseProto::new(transport.clone(), TEST_TIMEOUT);
        transport.register_handler(PROTOCOL_ID, base.clone()).await;
        let handshake = HandshakeProto::new(base, PASSPHRASE, 60_000);
        handshake.register().await;
        let node = SwarmProto::new(handshake, params);
        node.register().await;

        node.save_local(blake2b(b"x"), "x".to_owned()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        node.storage_audit().await;
        // The audit re-replicated (locally) and refreshed the item
        let storage = node.storage.lock().await;
        let item = storage.peek(&blake2b(b"x")).unwrap();
        assert!(now_millis().saturating_sub(item.created_at) < 1_000);
    }
}
