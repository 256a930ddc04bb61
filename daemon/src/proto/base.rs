//! BaseProto: wire framing, parcel correlation, admission limiting.
//!
//! One parcel per stream. Outbound requests register a one-shot callback
//! keyed by the parcel's UUID; the inbound dispatcher completes it when
//! the matching `Return` arrives, or the deadline fires and synthesizes a
//! rejection. Inbound parcels pass a per-peer rate window and a duplicate
//! fingerprint check before they are parsed at all.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, trace, warn};
use lru::LruCache;
use metrics::counter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;

use veil_common::crypto::hash::blake2b;
use veil_common::crypto::{Address, Digest};

use crate::config::{
    CALLBACK_CAPACITY, EXCESSIVE_DUPLICATES, LIMITER_CAPACITY, MAX_PARCEL_SIZE, PROTOCOL_ID,
    RATE_LIMIT,
};
use crate::transport::{BoxedStream, ProtocolHandler, Transport, TransportError};

use super::error::{ProtoError, ProtoResult};
use super::parcel::{CallbackId, Parcel, Payload, Request, RequestKind, ResponseData, Return};

// Compile-time validation that the cache capacities are non-zero
// These assertions ensure that NonZeroUsize::new_unchecked is safe to use
const _: () = assert!(CALLBACK_CAPACITY > 0, "CALLBACK_CAPACITY must be non-zero");
const _: () = assert!(LIMITER_CAPACITY > 0, "LIMITER_CAPACITY must be non-zero");

/// Handler for one request kind.
///
/// `Ok(Some(data))` answers the peer, `Err` answers with a rejection
/// parcel carrying the error message, and `Ok(None)` drops the request
/// without any response at all (validation failures: the peer times out).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        sender: &Address,
        request: Request,
    ) -> anyhow::Result<Option<ResponseData>>;
}

// Fixed admission window stamped at first sight
struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    // Count one hit, resetting the window if it has lapsed
    fn hit(&mut self, span: Duration) -> u32 {
        if self.started.elapsed() >= span {
            self.started = Instant::now();
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count
    }
}

/// The bottom protocol layer. Upper layers share one instance per node.
pub struct BaseProto {
    transport: Arc<dyn Transport>,
    // per-request deadline, also the admission window span
    timeout: Duration,
    // outstanding calls: one entry per in-flight request until the
    // response arrives or the deadline fires
    callbacks: Mutex<LruCache<CallbackId, oneshot::Sender<Return>>>,
    // request handlers registered by the upper layers
    handlers: RwLock<HashMap<RequestKind, Arc<dyn RequestHandler>>>,
    // parcels per remote peer in the current window
    rate_limiter: Mutex<LruCache<Address, Window>>,
    // parcel fingerprints seen in the current window
    seen_fingerprints: Mutex<LruCache<Digest, Window>>,
}

impl BaseProto {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            timeout,
            callbacks: Mutex::new(LruCache::new(
                // SAFETY: Compile-time assertion above guarantees CALLBACK_CAPACITY > 0
                unsafe { NonZeroUsize::new_unchecked(CALLBACK_CAPACITY) },
            )),
            handlers: RwLock::new(HashMap::new()),
            rate_limiter: Mutex::new(LruCache::new(
                // SAFETY: Compile-time assertion above guarantees LIMITER_CAPACITY > 0
                unsafe { NonZeroUsize::new_unchecked(LIMITER_CAPACITY) },
            )),
            seen_fingerprints: Mutex::new(LruCache::new(
                // SAFETY: Compile-time assertion above guarantees LIMITER_CAPACITY > 0
                unsafe { NonZeroUsize::new_unchecked(LIMITER_CAPACITY) },
            )),
        })
    }

    /// Address of the local node.
    pub fn local_address(&self) -> &Address {
        self.transport.local_address()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the handler for one request kind, replacing any previous.
    pub async fn register_handler(&self, kind: RequestKind, handler: Arc<dyn RequestHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(kind, handler);
    }

    /// Drop every registered handler.
    pub async fn clear_handlers(&self) {
        let mut handlers = self.handlers.write().await;
        handlers.clear();
    }

    /// Send a request and await its response or the deadline.
    pub async fn send_request(&self, peer: &Address, request: Request) -> ProtoResult<ResponseData> {
        let callback_id = CallbackId::random();
        let (tx, rx) = oneshot::channel();
        {
            let mut callbacks = self.callbacks.lock().await;
            // An eviction here drops the oldest sender, surfacing to its
            // waiter as a closed channel
            callbacks.put(callback_id, tx);
        }

        let parcel = Parcel::request(callback_id, self.local_address().clone(), request);
        if let Err(e) = self.transmit(peer, &parcel).await {
            let mut callbacks = self.callbacks.lock().await;
            callbacks.pop(&callback_id);
            return Err(e);
        }
        counter!("veil_requests_sent").increment(1);

        match timeout(self.timeout, rx).await {
            Ok(Ok(ret)) => ret.into_result(),
            Ok(Err(_closed)) => Err(ProtoError::CallbackDropped(peer.clone())),
            Err(_elapsed) => {
                let mut callbacks = self.callbacks.lock().await;
                callbacks.pop(&callback_id);
                counter!("veil_request_timeouts").increment(1);
                Err(ProtoError::Timeout(peer.clone()))
            }
        }
    }

    /// Send a response parcel re-using an inbound callback id.
    async fn respond(&self, peer: &Address, callback_id: CallbackId, ret: Return) {
        let parcel = Parcel::response(callback_id, self.local_address().clone(), ret);
        if let Err(e) = self.transmit(peer, &parcel).await {
            debug!("Failed to respond to {}: {}", peer, e);
        }
    }

    // Serialize and ship one parcel on a fresh stream, then close it
    async fn transmit(&self, peer: &Address, parcel: &Parcel) -> ProtoResult<()> {
        let bytes = serde_json::to_vec(parcel)?;
        let mut stream = self.transport.open_stream(peer, PROTOCOL_ID).await?;
        stream.write_all(&bytes).await.map_err(TransportError::Io)?;
        stream.shutdown().await.map_err(TransportError::Io)?;
        if log::log_enabled!(log::Level::Trace) {
            trace!("Sent {} bytes to {}", bytes.len(), peer);
        }
        Ok(())
    }

    /// Fail every outstanding call with a rejection. Used on shutdown.
    pub async fn drain_callbacks(&self, reason: &str) {
        let mut callbacks = self.callbacks.lock().await;
        while let Some((callback_id, tx)) = callbacks.pop_lru() {
            trace!("Draining outstanding call {}", callback_id);
            let _ = tx.send(Return::err(reason));
        }
    }

    /// Number of in-flight outbound requests.
    pub async fn outstanding_calls(&self) -> usize {
        self.callbacks.lock().await.len()
    }

    /// Reset the rate and duplicate admission caches.
    pub async fn clear_limiters(&self) {
        self.rate_limiter.lock().await.clear();
        self.seen_fingerprints.lock().await.clear();
    }

    // Per-peer admission window. True if the parcel may proceed.
    async fn admit_rate(&self, remote: &Address) -> bool {
        let mut limiter = self.rate_limiter.lock().await;
        let window = limiter.get_or_insert_mut(remote.clone(), Window::new);
        window.hit(self.timeout) <= RATE_LIMIT
    }

    // Duplicate fingerprint window. True only for the first sighting.
    async fn admit_unique(&self, fingerprint: &Digest) -> bool {
        let mut seen = self.seen_fingerprints.lock().await;
        let window = seen.get_or_insert_mut(fingerprint.clone(), Window::new);
        let count = window.hit(self.timeout);
        if count > EXCESSIVE_DUPLICATES {
            warn!("Excessive duplicates of parcel {}", fingerprint);
        }
        count == 1
    }

    // Full inbound path for one accumulated parcel
    async fn handle_parcel(&self, remote: Address, bytes: Vec<u8>) {
        counter!("veil_parcels_received").increment(1);

        if !self.admit_rate(&remote).await {
            warn!("Rate limit exceeded by {}, dropping parcel", remote);
            counter!("veil_parcels_dropped", "reason" => "rate").increment(1);
            return;
        }

        let fingerprint = blake2b(&bytes);
        if !self.admit_unique(&fingerprint).await {
            debug!("Duplicate parcel from {}, dropping", remote);
            counter!("veil_parcels_dropped", "reason" => "duplicate").increment(1);
            return;
        }

        let parcel: Parcel = match serde_json::from_slice(&bytes) {
            Ok(parcel) => parcel,
            Err(e) => {
                debug!("Invalid parcel from {}: {}", remote, e);
                counter!("veil_parcels_dropped", "reason" => "invalid").increment(1);
                return;
            }
        };

        // The declared sender must be the identity the transport verified
        if parcel.sender != remote {
            warn!(
                "Parcel sender {} does not match verified remote {}, dropping",
                parcel.sender, remote
            );
            counter!("veil_parcels_dropped", "reason" => "sender").increment(1);
            return;
        }

        match parcel.payload {
            Payload::Return(ret) => self.complete(parcel.callback_id, ret).await,
            Payload::Request(request) => {
                self.dispatch(remote, parcel.callback_id, request).await;
            }
        }
    }

    // Deliver a response to the waiting caller, if it is still there
    async fn complete(&self, callback_id: CallbackId, ret: Return) {
        let sender = {
            let mut callbacks = self.callbacks.lock().await;
            callbacks.pop(&callback_id)
        };
        match sender {
            Some(tx) => {
                if tx.send(ret).is_err() {
                    debug!("Caller for {} went away before its response", callback_id);
                }
            }
            None => debug!("Response for unknown callback {}, dropping", callback_id),
        }
    }

    // Route a request to its registered handler and answer the peer
    async fn dispatch(&self, remote: Address, callback_id: CallbackId, request: Request) {
        let kind = request.kind();
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&kind).cloned()
        };
        let Some(handler) = handler else {
            debug!("No handler for {}, dropping request from {}", kind, remote);
            return;
        };

        let ret = match handler.handle(&remote, request).await {
            Ok(Some(data)) => Return::ok(data),
            // Validation failure: no response, the peer times out
            Ok(None) => return,
            Err(e) => {
                debug!("Handler for {} rejected request from {}: {}", kind, remote, e);
                Return::err(e.to_string())
            }
        };
        self.respond(&remote, callback_id, ret).await;
    }
}

#[async_trait]
impl ProtocolHandler for BaseProto {
    async fn on_stream(&self, remote: Address, stream: BoxedStream) {
        // Accumulate the whole parcel, bounded, then close the stream
        let mut bytes = Vec::new();
        let mut bounded = stream.take(MAX_PARCEL_SIZE as u64);
        if let Err(e) = bounded.read_to_end(&mut bytes).await {
            debug!("Failed to read stream from {}: {}", remote, e);
            return;
        }
        self.handle_parcel(remote, bytes).await;
    }
}
