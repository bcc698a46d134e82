use bytes::Bytes;
use commonware_utils::hex;
use std::fmt;
use std::net::SocketAddr;

/// A peer's identity certificate: the opaque byte string under which the
/// peer signs. Supplied at startup for ourselves and learned during the
/// handshake for remote peers.
pub type PeerIdentity = Bytes;

/// Stable short identifier derived from a [PeerIdentity] by the identity
/// mapper. The unique key for all per-peer state.
pub type PkiId = Bytes;

/// Digest of a transport-layer certificate.
pub type CertHash = Bytes;

/// A send target: a network endpoint and, when known, the identity expected
/// to be found behind it.
#[derive(Clone, Debug)]
pub struct RemotePeer {
    pub endpoint: SocketAddr,
    pub pki_id: Option<PkiId>,
}

impl RemotePeer {
    pub fn new(endpoint: SocketAddr, pki_id: Option<PkiId>) -> Self {
        Self { endpoint, pki_id }
    }
}

impl fmt::Display for RemotePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pki_id {
            Some(pki_id) => write!(f, "{}@{}", hex(pki_id), self.endpoint),
            None => write!(f, "?@{}", self.endpoint),
        }
    }
}

/// Proof that a handshake bound the peer's identity to its transport
/// session: the envelope signature and the exact bytes it covers.
#[derive(Clone, Debug)]
pub struct AuthInfo {
    pub signature: Bytes,
    pub signed_bytes: Bytes,
}

/// The authenticated result of a handshake. Lives as long as the
/// connection it authenticated.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub pki_id: PkiId,
    pub identity: PeerIdentity,

    /// Present only when transport security was active on both ends and the
    /// binding was verified.
    pub auth: Option<AuthInfo>,
}
