//! Error types for the protocol stack.

use thiserror::Error;

use veil_common::crypto::shamir::ShamirError;
use veil_common::crypto::Address;

use crate::transport::TransportError;

/// Error type for protocol operations.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Opening or writing a stream failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Parcel encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No response arrived before the deadline.
    #[error("Timeout while waiting for response from: {0}")]
    Timeout(Address),

    /// The remote answered `success: false`.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The remote answered `success: true` without a data payload.
    #[error("Malformed return payload")]
    MalformedReturn,

    /// The outstanding call was evicted before a response arrived.
    #[error("Response channel closed for {0}")]
    CallbackDropped(Address),

    /// A freshness pulse to a peer failed, the request was not sent.
    #[error("Pulse failed for {0}")]
    PulseFailed(Address),

    /// The remote answered with an unexpected response variant.
    #[error("Unexpected response variant")]
    UnexpectedResponse,

    /// Splitting or combining message shares failed.
    #[error("Secret sharing error: {0}")]
    Shamir(#[from] ShamirError),
}

/// Result type alias for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;
