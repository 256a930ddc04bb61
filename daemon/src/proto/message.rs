//! MessageProto: Shamir-split messages with metadata buckets.
//!
//! A message envelope is serialized once, split into `shares` Shamir
//! shares, and every share is stored as its own swarm object. The share
//! hashes are then indexed in a per-recipient metadata bucket replicated
//! on the peers nearest `Blake3(recipient address)` — a keyspace distinct
//! from the Blake2b content space, so metadata holders and fragment
//! holders are uncorrelated. Retrieval unions the buckets, fetches the
//! fragments, and reconstructs every group with at least `threshold`
//! shares; incomplete groups are silently dropped.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexSet;
use log::{debug, trace, warn};
use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use veil_common::crypto::hash::{blake3, decode_base64_tagged, encode_base64_tagged};
use veil_common::crypto::{shamir, Address, Digest};
use veil_common::time::{now_millis, UnixMillis};

use crate::config::METADATA_CAPACITY;

use super::base::RequestHandler;
use super::error::{ProtoError, ProtoResult};
use super::parcel::{CallbackId, Request, RequestKind, ResponseData};
use super::swarm::SwarmProto;

// Compile-time validation that the bucket capacity is non-zero
const _: () = assert!(METADATA_CAPACITY > 0, "METADATA_CAPACITY must be non-zero");

/// A message as seen by senders and recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub text: String,
    pub timestamp: UnixMillis,
}

// One Shamir share of an envelope, stored as a swarm object. Shares of
// one message carry the same group id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageFragment {
    id: CallbackId,
    content: String,
}

/// Parameters of the message layer, lifted from the node configuration.
#[derive(Debug, Clone)]
pub struct MessageParams {
    pub metadata_swarm_size: usize,
    pub shares: u8,
    pub threshold: u8,
}

/// The messaging layer.
pub struct MessageProto {
    swarm: Arc<SwarmProto>,
    // owner address -> set of fragment hashes, union semantics
    metadata: Mutex<LruCache<Address, IndexSet<Digest>>>,
    params: MessageParams,
}

impl MessageProto {
    pub fn new(swarm: Arc<SwarmProto>, params: MessageParams) -> Arc<Self> {
        Arc::new(Self {
            swarm,
            metadata: Mutex::new(LruCache::new(
                // SAFETY: Compile-time assertion above guarantees METADATA_CAPACITY > 0
                unsafe { NonZeroUsize::new_unchecked(METADATA_CAPACITY) },
            )),
            params,
        })
    }

    /// Register the message request handlers with the base.
    pub async fn register(self: &Arc<Self>) {
        let handler: Arc<dyn RequestHandler> = Arc::new(MessageHandler {
            proto: self.clone(),
        });
        let base = self.swarm.handshake().base();
        base.register_handler(RequestKind::StoreMetadata, handler.clone())
            .await;
        base.register_handler(RequestKind::GetMetadata, handler)
            .await;
    }

    pub fn swarm(&self) -> &Arc<SwarmProto> {
        &self.swarm
    }

    pub fn local_address(&self) -> &Address {
        self.swarm.local_address()
    }

    /// Send one message to a recipient.
    pub async fn send_message(&self, recipient: &Address, text: &str) -> ProtoResult<()> {
        self.send_messages(recipient, &[text.to_owned()]).await
    }

    /// Send a batch of messages to a recipient.
    ///
    /// All groups' fragment hashes are aggregated into a single metadata
    /// update per holder.
    pub async fn send_messages(&self, recipient: &Address, texts: &[String]) -> ProtoResult<()> {
        let mut hashes: Vec<Digest> = Vec::new();
        for text in texts {
            let envelope = MessageEnvelope {
                text: text.clone(),
                timestamp: now_millis(),
            };
            let bytes = serde_json::to_vec(&envelope)?;
            let shares = shamir::split(&bytes, self.params.shares, self.params.threshold)?;

            let group = CallbackId::random();
            trace!("Message group {} split into {} shares", group, shares.len());
            for share in shares {
                let fragment = MessageFragment {
                    id: group,
                    content: encode_base64_tagged(&share),
                };
                let json = serde_json::to_string(&fragment)?;
                hashes.push(self.swarm.store(&json).await?);
            }
        }
        if hashes.is_empty() {
            return Ok(());
        }

        let owner_hash = blake3(recipient.as_str().as_bytes());
        let holders = self
            .swarm
            .nearest_peers(&owner_hash, self.params.metadata_swarm_size)
            .await;
        let updates = holders
            .iter()
            .map(|holder| self.store_metadata_at(holder, recipient, &hashes));
        let results = join_all(updates).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        counter!("veil_messages_sent").increment(texts.len() as u64);
        if delivered == 0 {
            warn!("Metadata for {} reached no holders", recipient);
        }
        Ok(())
    }

    // Index fragment hashes with one metadata holder; self updates the
    // local bucket
    async fn store_metadata_at(
        &self,
        holder: &Address,
        owner: &Address,
        hashes: &[Digest],
    ) -> ProtoResult<()> {
        if holder == self.local_address() {
            self.store_metadata_local(owner, hashes).await;
            return Ok(());
        }
        let request = Request::StoreMetadata {
            owner: owner.clone(),
            metadata: hashes.to_vec(),
            stamp: None,
        };
        match self.swarm.handshake().send_stamped(holder, request).await {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("Metadata update at {} failed: {}", holder, e);
                Err(e)
            }
        }
    }

    /// Union hashes into the local bucket for `owner`.
    pub async fn store_metadata_local(&self, owner: &Address, hashes: &[Digest]) {
        let mut metadata = self.metadata.lock().await;
        let bucket = metadata.get_or_insert_mut(owner.clone(), IndexSet::new);
        bucket.extend(hashes.iter().cloned());
    }

    /// The local bucket for `owner`.
    pub async fn metadata_for(&self, owner: &Address) -> Vec<Digest> {
        let mut metadata = self.metadata.lock().await;
        match metadata.get(owner) {
            Some(bucket) => bucket.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Number of owners with a local bucket.
    pub async fn metadata_owners(&self) -> usize {
        self.metadata.lock().await.len()
    }

    pub async fn clear_metadata(&self) {
        self.metadata.lock().await.clear();
    }

    // Read one holder's bucket for `owner`; self reads locally
    async fn fetch_metadata_from(
        &self,
        holder: &Address,
        owner: &Address,
    ) -> ProtoResult<Vec<Digest>> {
        if holder == self.local_address() {
            return Ok(self.metadata_for(owner).await);
        }
        let request = Request::GetMetadata {
            address: owner.clone(),
            stamp: None,
        };
        match self.swarm.handshake().send_stamped(holder, request).await? {
            ResponseData::Metadata { metadata } => Ok(metadata),
            _ => Err(ProtoError::UnexpectedResponse),
        }
    }

    /// Retrieve and reconstruct every readable message for `address`.
    ///
    /// Groups with fewer than `threshold` retrievable shares are dropped
    /// without a trace.
    pub async fn get_inbox(&self, address: &Address) -> ProtoResult<Vec<MessageEnvelope>> {
        let owner_hash = blake3(address.as_str().as_bytes());
        let holders = self
            .swarm
            .nearest_peers(&owner_hash, self.params.metadata_swarm_size)
            .await;

        let queries = holders
            .iter()
            .map(|holder| self.fetch_metadata_from(holder, address));
        let mut hashes: IndexSet<Digest> = IndexSet::new();
        for result in join_all(queries).await {
            match result {
                Ok(list) => hashes.extend(list),
                Err(e) => debug!("Metadata query failed: {}", e),
            }
        }
        trace!("Inbox for {}: {} candidate fragments", address, hashes.len());

        let fetches = hashes.iter().map(|hash| self.swarm.fetch(hash));
        let fragments = join_all(fetches).await;

        let mut groups: HashMap<CallbackId, Vec<Vec<u8>>> = HashMap::new();
        for json in fragments.into_iter().flatten() {
            let fragment: MessageFragment = match serde_json::from_str(&json) {
                Ok(fragment) => fragment,
                Err(e) => {
                    debug!("Undecodable fragment, dropping: {}", e);
                    continue;
                }
            };
            match decode_base64_tagged(&fragment.content) {
                Ok(share) => groups.entry(fragment.id).or_default().push(share),
                Err(e) => debug!("Undecodable share in group {}: {}", fragment.id, e),
            }
        }

        let mut inbox = Vec::new();
        for (group, shares) in groups {
            if shares.len() < self.params.threshold as usize {
                debug!(
                    "Group {} has {} of {} required shares, dropping",
                    group,
                    shares.len(),
                    self.params.threshold
                );
                continue;
            }
            let bytes = match shamir::combine(&shares) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("Group {} failed to combine: {}", group, e);
                    continue;
                }
            };
            match serde_json::from_slice::<MessageEnvelope>(&bytes) {
                Ok(envelope) => inbox.push(envelope),
                Err(_) => debug!("Group {} reconstructed to garbage, dropping", group),
            }
        }

        inbox.sort_by_key(|envelope| envelope.timestamp);
        counter!("veil_messages_reconstructed").increment(inbox.len() as u64);
        Ok(inbox)
    }
}

struct MessageHandler {
    proto: Arc<MessageProto>,
}

#[async_trait]
impl RequestHandler for MessageHandler {
    async fn handle(
        &self,
        sender: &Address,
        request: Request,
    ) -> anyhow::Result<Option<ResponseData>> {
        if !self.proto.swarm.handshake().verify_stamp(&request) {
            warn!("Invalid stamp on {} from {}", request.kind(), sender);
            return Ok(None);
        }
        match request {
            Request::StoreMetadata {
                owner, metadata, ..
            } => {
                self.proto.store_metadata_local(&owner, &metadata).await;
                Ok(Some(ResponseData::Empty))
            }
            Request::GetMetadata { address, .. } => {
                let metadata = self.proto.metadata_for(&address).await;
                Ok(Some(ResponseData::Metadata { metadata }))
            }
            other => anyhow::bail!("unexpected request {}", other.kind()),
        }
    }
}
