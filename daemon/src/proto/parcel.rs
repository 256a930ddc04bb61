//! Wire model.
//!
//! A parcel is one JSON message on the wire, sent as the entire payload
//! of one freshly opened stream:
//!
//! ```text
//! Parcel := {callbackId: UUID, sender: Address, payload: Request | Return}
//! Return := {success: true, data: Response} | {success: false, message: string}
//! ```
//!
//! Every request variant carries a `type` discriminator and a `stamp`
//! proving possession of the shared passphrase for the current TOTP
//! window. Unknown discriminators fail to deserialize and are dropped by
//! the dispatcher.

use std::fmt::{Display, Error, Formatter};
use std::str::FromStr;

use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use veil_common::crypto::{Address, Digest};

use super::error::{ProtoError, ProtoResult};

/// Optional tag prefix on UUIDs. Stripped by newer senders; both forms
/// must be accepted for backwards compatibility.
pub const UUID_TAG: &str = "uuid,";

/// Correlation identifier of a parcel, also used for message group ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(Uuid);

impl CallbackId {
    pub fn random() -> Self {
        CallbackId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for CallbackId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.strip_prefix(UUID_TAG).unwrap_or(s);
        Ok(CallbackId(Uuid::parse_str(body)?))
    }
}

impl Display for CallbackId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.0)
    }
}

impl Serialize for CallbackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for CallbackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CallbackId::from_str(&s).map_err(SerdeError::custom)
    }
}

/// Discriminator of a request variant, used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    SecretHandshake,
    RequestPulse,
    NearestPeers,
    Store,
    Fetch,
    StoreMetadata,
    GetMetadata,
}

impl RequestKind {
    /// The on-wire `type` string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::SecretHandshake => "handshake:secret-handshake",
            RequestKind::RequestPulse => "handshake:request-pulse",
            RequestKind::NearestPeers => "swarm:nearest-peers-request",
            RequestKind::Store => "swarm:store-request",
            RequestKind::Fetch => "swarm:fetch-request",
            RequestKind::StoreMetadata => "message:store-metadata-request",
            RequestKind::GetMetadata => "message:get-metadata-request",
        }
    }
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", self.as_str())
    }
}

/// A request payload. The `stamp` field is unset while computing or
/// verifying the stamp and set on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "handshake:secret-handshake")]
    SecretHandshake {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<String>,
    },

    #[serde(rename = "handshake:request-pulse")]
    RequestPulse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<String>,
    },

    #[serde(rename = "swarm:nearest-peers-request")]
    NearestPeers {
        n: usize,
        hash: Digest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<String>,
    },

    #[serde(rename = "swarm:store-request")]
    Store {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<String>,
    },

    #[serde(rename = "swarm:fetch-request")]
    Fetch {
        hash: Digest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<String>,
    },

    #[serde(rename = "message:store-metadata-request")]
    StoreMetadata {
        owner: Address,
        metadata: Vec<Digest>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<String>,
    },

    #[serde(rename = "message:get-metadata-request")]
    GetMetadata {
        address: Address,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stamp: Option<String>,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::SecretHandshake { .. } => RequestKind::SecretHandshake,
            Request::RequestPulse { .. } => RequestKind::RequestPulse,
            Request::NearestPeers { .. } => RequestKind::NearestPeers,
            Request::Store { .. } => RequestKind::Store,
            Request::Fetch { .. } => RequestKind::Fetch,
            Request::StoreMetadata { .. } => RequestKind::StoreMetadata,
            Request::GetMetadata { .. } => RequestKind::GetMetadata,
        }
    }

    pub fn stamp(&self) -> Option<&str> {
        match self {
            Request::SecretHandshake { stamp }
            | Request::RequestPulse { stamp }
            | Request::NearestPeers { stamp, .. }
            | Request::Store { stamp, .. }
            | Request::Fetch { stamp, .. }
            | Request::StoreMetadata { stamp, .. }
            | Request::GetMetadata { stamp, .. } => stamp.as_deref(),
        }
    }

    pub fn set_stamp(&mut self, value: Option<String>) {
        match self {
            Request::SecretHandshake { stamp }
            | Request::RequestPulse { stamp }
            | Request::NearestPeers { stamp, .. }
            | Request::Store { stamp, .. }
            | Request::Fetch { stamp, .. }
            | Request::StoreMetadata { stamp, .. }
            | Request::GetMetadata { stamp, .. } => *stamp = value,
        }
    }

    /// The canonical byte sequence a stamp commits to: the JSON
    /// serialization of this request with `stamp` unset.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut unstamped = self.clone();
        unstamped.set_stamp(None);
        serde_json::to_vec(&unstamped)
    }
}

/// A response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseData {
    #[serde(rename = "base:empty-response")]
    Empty,

    #[serde(rename = "swarm:nearest-peers-response")]
    NearestPeers { peers: Vec<Address> },

    #[serde(rename = "swarm:fetch-response")]
    Fetch { fragment: Option<String> },

    #[serde(rename = "message:get-metadata-response")]
    Metadata { metadata: Vec<Digest> },
}

/// Response form of a parcel payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Return {
    pub fn ok(data: ResponseData) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn into_result(self) -> ProtoResult<ResponseData> {
        if self.success {
            self.data.ok_or(ProtoError::MalformedReturn)
        } else {
            Err(ProtoError::Rejected(
                self.message.unwrap_or_else(|| "unspecified".to_owned()),
            ))
        }
    }
}

/// Either form of a parcel payload.
///
/// Untagged: a `Request` is recognized by its `type` discriminator, a
/// `Return` by its `success` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Return(Return),
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    #[serde(rename = "callbackId")]
    pub callback_id: CallbackId,
    pub sender: Address,
    pub payload: Payload,
}

impl Parcel {
    pub fn request(callback_id: CallbackId, sender: Address, request: Request) -> Self {
        Self {
            callback_id,
            sender,
            payload: Payload::Request(request),
        }
    }

    pub fn response(callback_id: CallbackId, sender: Address, ret: Return) -> Self {
        Self {
            callback_id,
            sender,
            payload: Payload::Return(ret),
        }
    }
}
