//! Rotating step keys over the shared initiation token.
//!
//! Every request is stamped with a keyed Blake2b digest whose key rotates
//! on a fixed wall-clock schedule, TOTP style: the key for a step is the
//! truncated HMAC-SHA256 of the step counter under the initiation token.
//! Any party knowing the token can produce the key for the current step
//! and nothing else.
//!
//! Parameters (fixed by this implementation):
//! - step size: 30 seconds
//! - key size: 8 bytes (64 bits), RFC 4226 dynamic-offset truncation
//!   widened from 4 to 8 bytes
//! - verification tolerance: the previous, current and next step are all
//!   accepted, so a stamp stays valid across one epoch boundary in either
//!   direction

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::time::UnixSeconds;

type HmacSha256 = Hmac<Sha256>;

/// Step size of the rotating key schedule, in seconds.
pub const STEP_SECONDS: u64 = 30;

/// Size of a derived step key in bytes.
pub const STEP_KEY_SIZE: usize = 8;

pub type StepKey = [u8; STEP_KEY_SIZE];

/// The step counter a timestamp falls into.
#[inline]
pub fn step_at(now: UnixSeconds) -> u64 {
    now / STEP_SECONDS
}

/// Derive the key for a given step counter.
pub fn key_for_step(secret: &[u8], step: u64) -> StepKey {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any size");
    mac.update(&step.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // RFC 4226 dynamic truncation, widened to STEP_KEY_SIZE bytes.
    // The low nibble of the last byte is at most 15 and the digest is
    // 32 bytes, so the window always fits.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let mut key = [0u8; STEP_KEY_SIZE];
    key.copy_from_slice(&digest[offset..offset + STEP_KEY_SIZE]);
    key
}

/// Key for the step containing `now`.
pub fn current_key(secret: &[u8], now: UnixSeconds) -> StepKey {
    key_for_step(secret, step_at(now))
}

/// Keys a verifier should accept at `now`: previous, current and next step.
pub fn acceptable_keys(secret: &[u8], now: UnixSeconds) -> [StepKey; 3] {
    let step = step_at(now);
    [
        key_for_step(secret, step.saturating_sub(1)),
        key_for_step(secret, step),
        key_for_step(secret, step.saturating_add(1)),
    ]
}
