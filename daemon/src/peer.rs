//! Peer table.
//!
//! Admitted peers and the last time each proved liveness. Entries are
//! refreshed by successful handshakes and pulses, evicted on disconnect,
//! pulse failure or LRU pressure. A peer older than the freshness
//! threshold is stale and must be re-pulsed before the next outbound
//! request to it.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

use veil_common::crypto::Address;
use veil_common::time::{now_millis, UnixMillis};

use crate::config::PEER_TABLE_CAPACITY;

// Compile-time validation that the table capacity is non-zero
const _: () = assert!(PEER_TABLE_CAPACITY > 0, "PEER_TABLE_CAPACITY must be non-zero");

/// Entry for one admitted peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: Address,
    /// When this peer last proved liveness.
    pub last_seen: UnixMillis,
}

impl PeerRecord {
    fn new(address: Address) -> Self {
        Self {
            last_seen: now_millis(),
            address,
        }
    }

    /// Age of the record relative to now.
    pub fn age(&self) -> UnixMillis {
        now_millis().saturating_sub(self.last_seen)
    }
}

/// The set of admitted peers, LRU-bounded.
pub struct PeerTable {
    peers: Mutex<LruCache<Address, PeerRecord>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(LruCache::new(
                // SAFETY: Compile-time assertion above guarantees PEER_TABLE_CAPACITY > 0
                unsafe { NonZeroUsize::new_unchecked(PEER_TABLE_CAPACITY) },
            )),
        }
    }

    /// Insert the peer or refresh its last-seen time.
    pub async fn touch(&self, address: &Address) {
        let mut peers = self.peers.lock().await;
        match peers.get_mut(address) {
            Some(record) => record.last_seen = now_millis(),
            None => {
                peers.put(address.clone(), PeerRecord::new(address.clone()));
            }
        }
    }

    /// Remove a peer.
    pub async fn remove(&self, address: &Address) -> Option<PeerRecord> {
        let mut peers = self.peers.lock().await;
        peers.pop(address)
    }

    /// Look up a peer without touching its LRU position.
    pub async fn get(&self, address: &Address) -> Option<PeerRecord> {
        let peers = self.peers.lock().await;
        peers.peek(address).cloned()
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.get(address).await.is_some()
    }

    /// Present and younger than the freshness threshold.
    pub async fn is_fresh(&self, address: &Address, freshness: UnixMillis) -> bool {
        match self.get(address).await {
            Some(record) => record.age() <= freshness,
            None => false,
        }
    }

    /// Peers whose age exceeds the freshness threshold.
    pub async fn stale_peers(&self, freshness: UnixMillis) -> Vec<Address> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .filter(|(_, record)| record.age() > freshness)
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// All known peer addresses.
    pub async fn known_peers(&self) -> Vec<Address> {
        let peers = self.peers.lock().await;
        peers.iter().map(|(address, _)| address.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.peers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> Address {
        Address::from_identity_bytes(&[n; 8])
    }

    #[tokio::test]
    async fn test_touch_inserts_and_refreshes() {
        let table = PeerTable::new();
        assert!(table.is_empty().await);

        table.touch(&peer(1)).await;
        assert_eq!(table.len().await, 1);
        assert!(table.contains(&peer(1)).await);

        let first = table.get(&peer(1)).await.unwrap().last_seen;
        table.touch(&peer(1)).await;
        assert_eq!(table.len().await, 1);
        assert!(table.get(&peer(1)).await.unwrap().last_seen >= first);
    }

    #[tokio::test]
    async fn test_remove() {
        let table = PeerTable::new();
        table.touch(&peer(1)).await;

        assert!(table.remove(&peer(1)).await.is_some());
        assert!(!table.contains(&peer(1)).await);
        assert!(table.remove(&peer(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_freshness() {
        let table = PeerTable::new();
        table.touch(&peer(1)).await;

        assert!(table.is_fresh(&peer(1), 60_000).await);
        // A zero threshold makes any real entry stale on the next check
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(!table.is_fresh(&peer(1), 0).await);
        assert!(!table.is_fresh(&peer(2), 60_000).await);
    }

    #[tokio::test]
    async fn test_stale_peers() {
        let table = PeerTable::new();
        table.touch(&peer(1)).await;
        table.touch(&peer(2)).await;

        assert!(table.stale_peers(60_000).await.is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let stale = table.stale_peers(0).await;
        assert_eq!(stale.len(), 2);
    }

    #[tokio::test]
    async fn test_known_peers() {
        let table = PeerTable::new();
        for n in 0..5 {
            table.touch(&peer(n)).await;
        }
        assert_eq!(table.known_peers().await.len(), 5);
    }

    #[tokio::test]
    async fn test_clear() {
        let table = PeerTable::new();
        table.touch(&peer(1)).await;
        table.clear().await;
        assert!(table.is_empty().await);
    }
}
