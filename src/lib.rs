//! Move authenticated, signed gossip messages between peers over
//! bidirectional streams.
//!
//! This crate implements the connection layer of a gossip overlay for a
//! permissioned ledger: dialing and accepting streams, deduplicating
//! sessions per peer identity, binding application-layer identities to
//! transport sessions during a connection-establish handshake, and fanning
//! received messages out to subscribers.
//!
//! Identity management (certificate validation, signing, verification) and
//! transport security (TLS termination, certificate digests) are consumed
//! through the traits in [api]; the [Comm] facade owns everything else.

use prost::DecodeError;
use thiserror::Error;

pub mod api;
mod comm;
mod config;
mod connection;
mod demux;
mod envelope;
mod handshake;
mod metrics;
#[cfg(test)]
mod mocks;
mod store;
mod types;

pub mod wire {
    include!(concat!(env!("OUT_DIR"), "/wire.rs"));
}

pub use comm::Comm;
pub use config::Config;
pub use connection::ReceivedMessage;
pub use demux::MessageAcceptor;
pub use envelope::{gossip, SignedMessage};
pub use types::{AuthInfo, CertHash, ConnectionInfo, PeerIdentity, PkiId, RemotePeer};

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("handshake timeout")]
    HandshakeTimeout,
    #[error("wrong message type")]
    WrongType,
    #[error("missing pki id")]
    MissingPkiId,
    #[error("identity rejected: {0}")]
    IdentityRejected(String),
    #[error("pki id mismatch")]
    PkiMismatch,
    #[error("transport certificate binding mismatch")]
    BindingMismatch,
    #[error("missing transport certificate")]
    MissingTransportCert,
    #[error("missing signature")]
    MissingSignature,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("send buffer overflow")]
    SendOverflow,
    #[error("stream broken")]
    StreamBroken,
    #[error("connection closed")]
    Closed,
    #[error("stopping")]
    Stopping,
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("unable to decode: {0}")]
    UnableToDecode(DecodeError),
}
