//! Peer addresses.
//!
//! An address is the self-describing textual form of a peer identity:
//! the `base58,` tag followed by the Base58Btc encoding of the identity
//! bytes handed out by the transport. Two addresses compare by exact
//! string equality.

use std::fmt::{Display, Error, Formatter};
use std::str::FromStr;

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::hash::{blake2b, Digest};
use super::CodecError;

/// Tag prefix for Base58-encoded strings on the wire.
pub const BASE58_TAG: &str = "base58,";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(String);

impl Address {
    /// Parse a textual address, validating the tag and the Base58 body.
    pub fn parse(s: &str) -> Result<Self, CodecError> {
        let body = s
            .strip_prefix(BASE58_TAG)
            .ok_or(CodecError::MissingTag(BASE58_TAG))?;
        bs58::decode(body)
            .into_vec()
            .map_err(|_| CodecError::InvalidBody("base58"))?;
        Ok(Address(s.to_owned()))
    }

    /// Derive the address for a transport identity.
    pub fn from_identity_bytes(bytes: &[u8]) -> Self {
        Address(format!("{}{}", BASE58_TAG, bs58::encode(bytes).into_string()))
    }

    /// Recover the raw identity bytes encoded in the body.
    pub fn identity_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let body = &self.0[BASE58_TAG.len()..];
        bs58::decode(body)
            .into_vec()
            .map_err(|_| CodecError::InvalidBody("base58"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Position of this peer in the proximity keyspace.
    ///
    /// Content is placed at `Blake2b(content)` and peers at
    /// `Blake2b(address)`, so both live in the same 256-bit space.
    pub fn position(&self) -> Digest {
        blake2b(self.0.as_bytes())
    }
}

impl FromStr for Address {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(SerdeError::custom)
    }
}
