//! 32-byte digests with a `base64,`-tagged textual form.
//!
//! Content and peer positions are Blake2b-256; request stamps are keyed
//! Blake2b-256; metadata routing uses Blake3-256. All three produce the
//! same [`Digest`] type.

use std::fmt::{Display, Error, Formatter};
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::{Blake2b, Blake2bMac, Digest as _};
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::CodecError;

pub const DIGEST_SIZE: usize = 32; // 32 bytes / 256 bits

/// Tag prefix for Base64-encoded strings on the wire.
pub const BASE64_TAG: &str = "base64,";

type Blake2b256 = Blake2b<U32>;
type Blake2bMac256 = Blake2bMac<U32>;

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    pub const fn new(bytes: [u8; DIGEST_SIZE]) -> Self {
        Digest(bytes)
    }

    pub const fn zero() -> Self {
        Digest::new([0; DIGEST_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; DIGEST_SIZE] {
        self.0
    }

    /// Tagged textual form, `base64,` followed by the standard Base64 body.
    pub fn to_tagged(&self) -> String {
        encode_base64_tagged(&self.0)
    }
}

impl FromStr for Digest {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_base64_tagged(s)?;
        let bytes: [u8; DIGEST_SIZE] =
            bytes
                .try_into()
                .map_err(|b: Vec<u8>| CodecError::InvalidLength {
                    expected: DIGEST_SIZE,
                    got: b.len(),
                })?;
        Ok(Digest::new(bytes))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.to_tagged())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "Digest({})", self.to_tagged())
    }
}

impl AsRef<Digest> for Digest {
    fn as_ref(&self) -> &Digest {
        self
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_tagged())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(SerdeError::custom)
    }
}

/// Hash a byte slice with unkeyed Blake2b-256.
#[inline]
pub fn blake2b(value: &[u8]) -> Digest {
    let result: [u8; DIGEST_SIZE] = Blake2b256::digest(value).into();
    Digest(result)
}

/// Hash a byte slice with Blake2b-256 keyed by `key`.
///
/// Blake2b accepts keys of 1 to 64 bytes; the rotating stamp keys are
/// 8 bytes (see [`super::totp`]).
#[inline]
pub fn blake2b_keyed(key: &[u8], value: &[u8]) -> Digest {
    let mut mac =
        Blake2bMac256::new_from_slice(key).expect("Blake2b accepts keys of 1 to 64 bytes");
    mac.update(value);
    let result: [u8; DIGEST_SIZE] = mac.finalize().into_bytes().into();
    Digest(result)
}

/// Hash a byte slice with Blake3-256.
#[inline]
pub fn blake3(value: &[u8]) -> Digest {
    let result: [u8; DIGEST_SIZE] = blake3::hash(value).into();
    Digest(result)
}

/// Encode bytes as a `base64,`-tagged string.
pub fn encode_base64_tagged(bytes: &[u8]) -> String {
    format!("{}{}", BASE64_TAG, BASE64.encode(bytes))
}

/// Decode a Base64 string, accepting both the tagged and the bare form.
pub fn decode_base64_tagged(s: &str) -> Result<Vec<u8>, CodecError> {
    let body = s.strip_prefix(BASE64_TAG).unwrap_or(s);
    BASE64
        .decode(body)
        .map_err(|_| CodecError::InvalidBody("base64"))
}
