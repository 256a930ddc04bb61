//! Cryptographic primitives shared across the overlay.
//!
//! - [`hash`]: 32-byte [`Digest`](hash::Digest) with Blake2b (keyed and
//!   unkeyed) and Blake3 constructors, `base64,`-tagged textual form.
//! - [`address`]: `base58,`-tagged peer addresses derived from identity bytes.
//! - [`distance`]: XOR popcount distance and proximity ordering.
//! - [`totp`]: rotating step keys over the shared initiation token.
//! - [`shamir`]: GF(256) secret sharing used by the messaging layer.

pub mod address;
pub mod distance;
pub mod hash;
pub mod shamir;
pub mod totp;

use thiserror::Error;

pub use address::Address;
pub use hash::Digest;

/// Error type for the tagged textual codecs (addresses and digests).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The expected `base58,` / `base64,` tag prefix is missing.
    #[error("Missing '{0}' tag prefix")]
    MissingTag(&'static str),

    /// The body after the tag does not decode.
    #[error("Invalid {0} body")]
    InvalidBody(&'static str),

    /// Decoded byte length does not match the expected size.
    #[error("Invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}
