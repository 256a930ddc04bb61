//! Node configuration: normative protocol constants and the runtime
//! configuration surface.

use serde::{Deserialize, Serialize};

/// Protocol identifier registered on the transport. Backward
/// incompatibility is signaled only by the minor version.
pub const PROTOCOL_ID: &str = "/secret-handshake/proto/0.5.x";

/// Default shared passphrase gating admission.
///
/// Production deployments override this; every node of a deployment must
/// agree on the value.
pub const DEFAULT_PASSPHRASE: &str = "the beaten path is for beaten people";

/// Per-request deadline in milliseconds.
pub const REQUEST_TIMEOUT_MILLIS: u64 = 30_000;

/// Capacity of the outstanding-call table. Also the per-peer rate limit:
/// a peer gets at most this many parcels per timeout window.
pub const CALLBACK_CAPACITY: usize = 32;

/// Capacity of the rate/duplicate limiter caches.
pub const LIMITER_CAPACITY: usize = 2048;

/// Messages accepted from one peer within one timeout window.
pub const RATE_LIMIT: u32 = CALLBACK_CAPACITY as u32;

/// Duplicate count past which we log loudly instead of dropping quietly.
pub const EXCESSIVE_DUPLICATES: u32 = 8;

/// Upper bound on a single parcel, inbound streams are cut off here.
pub const MAX_PARCEL_SIZE: usize = 1024 * 1024;

/// Capacity of the peer table.
pub const PEER_TABLE_CAPACITY: usize = 128;

/// Capacity of the local fragment storage.
pub const STORAGE_CAPACITY: usize = 2048;

/// Capacity of the metadata bucket cache, in owners.
pub const METADATA_CAPACITY: usize = 2048;

/// Replication degree for stored content.
pub const SWARM_SIZE: usize = 3;

/// Replication degree for metadata buckets.
pub const METADATA_SWARM_SIZE: usize = 5;

/// Maximum rounds of the iterative nearest-peers lookup.
pub const MAX_DEPTH: usize = 5;

/// Hard cap on `n` accepted in a nearest-peers request.
pub const MAX_NEAREST_FANOUT: usize = 16;

/// Interval between pulse audit cycles, before jitter.
pub const PULSE_INTERVAL_MILLIS: u64 = 60_000;

/// Age past which a peer entry is stale and must be re-pulsed.
pub const PULSE_FRESHNESS_MILLIS: u64 = 120_000;

/// Interval between storage audit cycles, before jitter.
pub const STORAGE_AUDIT_INTERVAL_MILLIS: u64 = 60_000;

/// Age past which a stored item is stale and gets audited.
pub const STORAGE_FRESHNESS_MILLIS: u64 = 180_000;

/// Fresh items audited per cycle, picked by smallest self-distance.
pub const REDUNDANCY_MARGIN: usize = 10;

/// Upper bound of the uniform random jitter added to both audit timers.
pub const AUDIT_JITTER_MILLIS: u64 = 5_000;

/// Shares per message.
pub const SHAMIR_SHARES: u8 = 5;

/// Shares required to reconstruct a message.
pub const SHAMIR_THRESHOLD: u8 = 3;

const fn default_swarm_size() -> usize {
    SWARM_SIZE
}

const fn default_metadata_swarm_size() -> usize {
    METADATA_SWARM_SIZE
}

const fn default_max_depth() -> usize {
    MAX_DEPTH
}

const fn default_timeout_millis() -> u64 {
    REQUEST_TIMEOUT_MILLIS
}

const fn default_pulse_interval_millis() -> u64 {
    PULSE_INTERVAL_MILLIS
}

const fn default_pulse_freshness_millis() -> u64 {
    PULSE_FRESHNESS_MILLIS
}

const fn default_storage_audit_interval_millis() -> u64 {
    STORAGE_AUDIT_INTERVAL_MILLIS
}

const fn default_storage_freshness_millis() -> u64 {
    STORAGE_FRESHNESS_MILLIS
}

const fn default_redundancy_margin() -> usize {
    REDUNDANCY_MARGIN
}

fn default_passphrase() -> String {
    DEFAULT_PASSPHRASE.to_owned()
}

/// Configuration for a node.
///
/// Embedding binaries flatten this into their CLI; every field has a
/// default matching the normative constants.
#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Shared passphrase gating admission to the overlay.
    #[clap(name = "passphrase", long, env = "VEIL_PASSPHRASE", default_value = DEFAULT_PASSPHRASE)]
    #[serde(default = "default_passphrase")]
    pub passphrase: String,

    /// Replication degree for stored content.
    #[clap(name = "swarm-size", long, default_value_t = default_swarm_size())]
    #[serde(default = "default_swarm_size")]
    pub swarm_size: usize,

    /// Replication degree for metadata buckets.
    #[clap(name = "metadata-swarm-size", long, default_value_t = default_metadata_swarm_size())]
    #[serde(default = "default_metadata_swarm_size")]
    pub metadata_swarm_size: usize,

    /// Maximum rounds of the iterative nearest-peers lookup.
    #[clap(name = "max-depth", long, default_value_t = default_max_depth())]
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Per-request deadline in milliseconds.
    #[clap(name = "timeout", long, default_value_t = default_timeout_millis())]
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,

    /// Interval between pulse audit cycles in milliseconds.
    #[clap(name = "pulse-interval", long, default_value_t = default_pulse_interval_millis())]
    #[serde(default = "default_pulse_interval_millis")]
    pub pulse_interval_millis: u64,

    /// Age in milliseconds past which a peer entry must be re-pulsed.
    #[clap(name = "pulse-freshness", long, default_value_t = default_pulse_freshness_millis())]
    #[serde(default = "default_pulse_freshness_millis")]
    pub pulse_freshness_millis: u64,

    /// Interval between storage audit cycles in milliseconds.
    #[clap(name = "storage-audit-interval", long, default_value_t = default_storage_audit_interval_millis())]
    #[serde(default = "default_storage_audit_interval_millis")]
    pub storage_audit_interval_millis: u64,

    /// Age in milliseconds past which a stored item is audited.
    #[clap(name = "storage-freshness", long, default_value_t = default_storage_freshness_millis())]
    #[serde(default = "default_storage_freshness_millis")]
    pub storage_freshness_millis: u64,

    /// Fresh items audited per cycle by smallest self-distance.
    #[clap(name = "redundancy-margin", long, default_value_t = default_redundancy_margin())]
    #[serde(default = "default_redundancy_margin")]
    pub redundancy_margin: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            passphrase: default_passphrase(),
            swarm_size: SWARM_SIZE,
            metadata_swarm_size: METADATA_SWARM_SIZE,
            max_depth: MAX_DEPTH,
            timeout_millis: REQUEST_TIMEOUT_MILLIS,
            pulse_interval_millis: PULSE_INTERVAL_MILLIS,
            pulse_freshness_millis: PULSE_FRESHNESS_MILLIS,
            storage_audit_interval_millis: STORAGE_AUDIT_INTERVAL_MILLIS,
            storage_freshness_millis: STORAGE_FRESHNESS_MILLIS,
            redundancy_margin: REDUNDANCY_MARGIN,
        }
    }
}

impl NodeConfig {
    /// Check that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.passphrase.is_empty() {
            return Err("passphrase must not be empty".to_owned());
        }
        if self.swarm_size == 0 {
            return Err("swarm-size must be at least 1".to_owned());
        }
        if self.metadata_swarm_size == 0 {
            return Err("metadata-swarm-size must be at least 1".to_owned());
        }
        if self.max_depth == 0 {
            return Err("max-depth must be at least 1".to_owned());
        }
        if self.timeout_millis == 0 {
            return Err("timeout must be at least 1ms".to_owned());
        }
        if self.pulse_freshness_millis < self.pulse_interval_millis {
            return Err("pulse-freshness must not be shorter than pulse-interval".to_owned());
        }
        Ok(())
    }
}
