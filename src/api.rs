//! Interfaces to collaborators that live outside this crate.

use crate::{
    types::{CertHash, PeerIdentity, PkiId},
    Error,
};
use bytes::Bytes;
use std::net::SocketAddr;

/// Maps identity certificates to PKI-IDs and provides the signing and
/// verification primitives of the local identity store.
///
/// Implementations decide what makes an identity acceptable; [Mapper::put]
/// is consulted for every identity learned during a handshake and its
/// rejection is fatal to the session.
pub trait Mapper: Clone + Send + Sync + 'static {
    /// Derive the stable short identifier for an identity certificate.
    fn pki_id_of(&self, identity: &PeerIdentity) -> PkiId;

    /// Validate an identity and store it under the given PKI-ID.
    fn put(&self, pki_id: &PkiId, identity: &PeerIdentity) -> Result<(), Error>;

    /// Sign a message with the local identity key.
    fn sign(&self, msg: &[u8]) -> Result<Bytes, Error>;

    /// Verify a signature by the identity stored under `pki_id`.
    fn verify(&self, pki_id: &PkiId, signature: &[u8], msg: &[u8]) -> Result<(), Error>;
}

/// Reports the transport-layer certificate digests of established sessions.
///
/// When the transport runs without certificates both methods return `None`
/// and the handshake performs no binding.
pub trait TransportSecurity: Clone + Send + Sync + 'static {
    /// Digest of the certificate we present on every session, if any.
    fn self_cert_hash(&self) -> Option<CertHash>;

    /// Digest of the certificate observed from the remote end of the
    /// session with `peer`, if any.
    fn observed_cert_hash(&self, peer: SocketAddr) -> Option<CertHash>;
}

/// Transport security for deployments without certificates.
#[derive(Clone, Debug, Default)]
pub struct Insecure;

impl TransportSecurity for Insecure {
    fn self_cert_hash(&self) -> Option<CertHash> {
        None
    }

    fn observed_cert_hash(&self, _: SocketAddr) -> Option<CertHash> {
        None
    }
}
