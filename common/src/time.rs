//! Wall-clock timestamps.
//!
//! Peer freshness, storage age and message envelopes all measure
//! wall-clock age in unix-epoch milliseconds; the TOTP step schedule is
//! the one consumer counting whole seconds. None of this is expected to
//! agree across nodes beyond ordinary clock accuracy.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix-epoch milliseconds.
pub type UnixMillis = u64;

/// Unix-epoch seconds.
pub type UnixSeconds = u64;

// A clock set before the epoch saturates to zero instead of panicking,
// timestamps here are only ever compared for age
fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Current timestamp in milliseconds.
pub fn now_millis() -> UnixMillis {
    since_epoch().as_millis() as UnixMillis
}

/// Current timestamp in whole seconds.
pub fn now_seconds() -> UnixSeconds {
    since_epoch().as_secs()
}
