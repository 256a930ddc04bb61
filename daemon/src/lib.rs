//! Veil overlay node.
//!
//! A layered peer-to-peer overlay providing admission control via a
//! shared-secret handshake, XOR-distance peer lookup over logical
//! addresses, a content-addressed distributed store with swarm
//! replication and self-healing audits, and recipient-anonymized
//! asynchronous messaging built on Shamir secret sharing.
//!
//! ## Layers
//!
//! | Layer | Responsibility |
//! |-------|----------------|
//! | [`proto::BaseProto`] | wire framing, parcel correlation, rate & duplicate limiting |
//! | [`proto::HandshakeProto`] | stamped admission, peer table, pulse audit |
//! | [`proto::SwarmProto`] | proximity lookup, store/fetch, storage audit |
//! | [`proto::MessageProto`] | Shamir-split messages, metadata buckets |
//!
//! Each layer holds the one below it; [`node::Node`] wires the stack to a
//! [`transport::Transport`] and drives the background audits.

pub mod config;
pub mod node;
pub mod peer;
pub mod proto;
pub mod transport;

pub use veil_common as common;
