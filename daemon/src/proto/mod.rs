//! The four cooperating request/response protocols.
//!
//! One wire framing and one callback machinery are shared by the whole
//! stack; each layer holds the one below it and registers its request
//! handlers with the base:
//!
//! | Layer | Requests handled |
//! |-------|------------------|
//! | [`BaseProto`] | (framing and dispatch only) |
//! | [`HandshakeProto`] | `handshake:secret-handshake`, `handshake:request-pulse` |
//! | [`SwarmProto`] | `swarm:nearest-peers-request`, `swarm:store-request`, `swarm:fetch-request` |
//! | [`MessageProto`] | `message:store-metadata-request`, `message:get-metadata-request` |

pub mod base;
pub mod error;
pub mod handshake;
pub mod message;
pub mod parcel;
pub mod swarm;

pub use base::{BaseProto, RequestHandler};
pub use error::{ProtoError, ProtoResult};
pub use handshake::HandshakeProto;
pub use message::{MessageEnvelope, MessageProto};
pub use parcel::{CallbackId, Parcel, Payload, Request, RequestKind, ResponseData, Return};
pub use swarm::SwarmProto;
