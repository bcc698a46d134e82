//! Test implementations of the collaborator interfaces.

use crate::{
    api::{Mapper, TransportSecurity},
    types::{CertHash, PeerIdentity, PkiId},
    Error,
};
use bytes::Bytes;
use commonware_cryptography::{ed25519::Ed25519, Scheme};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

const NAMESPACE: &[u8] = b"_GOSSIP_COMM_AUTH_";

/// Identity mapper whose identities are raw ed25519 public keys and whose
/// PKI-IDs are their sha256 digests.
#[derive(Clone)]
pub(crate) struct TestMapper {
    scheme: Arc<Mutex<Ed25519>>,
    identities: Arc<Mutex<HashMap<PkiId, PeerIdentity>>>,
    reject: bool,
}

impl TestMapper {
    pub fn new(seed: u64) -> (Self, PeerIdentity) {
        let scheme = Ed25519::from_seed(seed);
        let identity: PeerIdentity = Bytes::from(scheme.public_key().to_vec());
        (
            Self {
                scheme: Arc::new(Mutex::new(scheme)),
                identities: Arc::new(Mutex::new(HashMap::new())),
                reject: false,
            },
            identity,
        )
    }

    /// A mapper that refuses every identity learned after its own.
    pub fn rejecting(seed: u64) -> (Self, PeerIdentity) {
        let (mut mapper, identity) = Self::new(seed);
        mapper.reject = true;
        // Install our own identity before rejection kicks in
        let pki_id = mapper.pki_id_of(&identity);
        mapper
            .identities
            .lock()
            .unwrap()
            .insert(pki_id, identity.clone());
        (mapper, identity)
    }
}

impl Mapper for TestMapper {
    fn pki_id_of(&self, identity: &PeerIdentity) -> PkiId {
        Bytes::from(Sha256::digest(identity).to_vec())
    }

    fn put(&self, pki_id: &PkiId, identity: &PeerIdentity) -> Result<(), Error> {
        let mut identities = self.identities.lock().unwrap();
        if self.reject && !identities.contains_key(pki_id) {
            return Err(Error::IdentityRejected("identity not admitted".into()));
        }
        if identity.len() != 32 {
            return Err(Error::IdentityRejected("malformed identity".into()));
        }
        if self.pki_id_of(identity) != *pki_id {
            return Err(Error::IdentityRejected(
                "pki id does not match identity".into(),
            ));
        }
        identities.insert(pki_id.clone(), identity.clone());
        Ok(())
    }

    fn sign(&self, msg: &[u8]) -> Result<Bytes, Error> {
        let signature = self.scheme.lock().unwrap().sign(NAMESPACE, msg);
        Ok(Bytes::from(signature.to_vec()))
    }

    fn verify(&self, pki_id: &PkiId, signature: &[u8], msg: &[u8]) -> Result<(), Error> {
        let identity = self
            .identities
            .lock()
            .unwrap()
            .get(pki_id)
            .cloned()
            .ok_or(Error::InvalidSignature)?;
        let public_key = identity.to_vec().into();
        let signature = signature.to_vec().into();
        if Ed25519::verify(NAMESPACE, msg, &public_key, &signature) {
            Ok(())
        } else {
            Err(Error::InvalidSignature)
        }
    }
}

/// Transport security backed by fixed digests: one for ourselves and one
/// we pretend to observe from every remote.
#[derive(Clone, Default)]
pub(crate) struct TestSecurity {
    self_hash: Option<CertHash>,
    observed: Option<CertHash>,
}

impl TestSecurity {
    /// Security disabled: no certificates on either end.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(self_hash: CertHash, observed: Option<CertHash>) -> Self {
        Self {
            self_hash: Some(self_hash),
            observed,
        }
    }
}

impl TransportSecurity for TestSecurity {
    fn self_cert_hash(&self) -> Option<CertHash> {
        self.self_hash.clone()
    }

    fn observed_cert_hash(&self, _: SocketAddr) -> Option<CertHash> {
        self.observed.clone()
    }
}
