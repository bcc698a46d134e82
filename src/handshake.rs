//! Connection-establish exchange run on every new stream.

use crate::{
    api::Mapper,
    envelope::{self, SignedMessage},
    types::{AuthInfo, CertHash, ConnectionInfo, PeerIdentity, PkiId},
    wire, Error,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Sink, Stream};
use std::time::Duration;

/// Runs the identity-binding handshake for one comm instance.
///
/// Both sides of a new stream exchange a signed `ConnEstablish`; the dialer
/// sends first and the acceptor answers after reading it. When transport
/// security is active on both ends, the envelope signature covers the
/// sender's transport-certificate digest, binding the application identity
/// to the transport session.
pub(crate) struct Authenticator<M: Mapper> {
    mapper: M,
    pki_id: PkiId,
    identity: PeerIdentity,
    skip_handshake: bool,
    conn_timeout: Duration,
    max_message_size: usize,
}

impl<M: Mapper> Authenticator<M> {
    pub fn new(
        mapper: M,
        pki_id: PkiId,
        identity: PeerIdentity,
        skip_handshake: bool,
        conn_timeout: Duration,
        max_message_size: usize,
    ) -> Self {
        Self {
            mapper,
            pki_id,
            identity,
            skip_handshake,
            conn_timeout,
            max_message_size,
        }
    }

    fn binding_active(&self, self_hash: &Option<CertHash>, observed: &Option<CertHash>) -> bool {
        self_hash.is_some() && observed.is_some() && !self.skip_handshake
    }

    /// Build our half of the exchange.
    fn conn_establish(
        &self,
        self_hash: &Option<CertHash>,
        bind: bool,
    ) -> Result<SignedMessage, Error> {
        let message = wire::Message {
            nonce: 0,
            payload: Some(wire::message::Payload::ConnEstablish(wire::ConnEstablish {
                pki_id: self.pki_id.clone(),
                identity: self.identity.clone(),
                tls_cert_hash: self_hash.clone().unwrap_or_default(),
            })),
        };
        if !bind {
            // Without transport security there is no session-unique text to
            // commit to, so the envelope is left unsigned.
            return Ok(SignedMessage::unsigned(message));
        }
        let hash = self_hash.as_ref().unwrap();
        let mut signed = SignedMessage::sign(message, |payload| self.mapper.sign(payload))?;
        signed.envelope.cert_signature = self.mapper.sign(hash)?;
        Ok(signed)
    }

    /// Dialer side: send our connection-establish, then verify the reply.
    pub async fn outbound<E, Si, St>(
        &self,
        context: &E,
        sink: &mut Si,
        stream: &mut St,
        self_hash: Option<CertHash>,
        observed: Option<CertHash>,
        expected: Option<&PkiId>,
    ) -> Result<ConnectionInfo, Error>
    where
        E: Clock,
        Si: Sink,
        St: Stream,
    {
        let deadline = context.current() + self.conn_timeout;
        let bind = self.binding_active(&self_hash, &observed);
        let hello = self.conn_establish(&self_hash, bind)?;
        select! {
            _timeout = context.sleep_until(deadline) => {
                return Err(Error::HandshakeTimeout);
            },
            result = envelope::send_envelope(sink, &hello.envelope) => {
                result?;
            },
        }
        let reply = select! {
            _timeout = context.sleep_until(deadline) => {
                return Err(Error::HandshakeTimeout);
            },
            result = envelope::recv_envelope(stream, self.max_message_size) => {
                result?
            },
        };
        self.verify_remote(reply, &self_hash, observed, expected)
    }

    /// Acceptor side: the peer's connection-establish already arrived;
    /// answer with ours, then verify theirs.
    pub async fn inbound<E, Si>(
        &self,
        context: &E,
        sink: &mut Si,
        received: wire::Envelope,
        self_hash: Option<CertHash>,
        observed: Option<CertHash>,
    ) -> Result<ConnectionInfo, Error>
    where
        E: Clock,
        Si: Sink,
    {
        let deadline = context.current() + self.conn_timeout;
        let bind = self.binding_active(&self_hash, &observed);
        let hello = self.conn_establish(&self_hash, bind)?;
        select! {
            _timeout = context.sleep_until(deadline) => {
                return Err(Error::HandshakeTimeout);
            },
            result = envelope::send_envelope(sink, &hello.envelope) => {
                result?;
            },
        }
        self.verify_remote(received, &self_hash, observed, None)
    }

    /// Verify the peer's connection-establish envelope and produce the
    /// session's [ConnectionInfo].
    fn verify_remote(
        &self,
        received: wire::Envelope,
        self_hash: &Option<CertHash>,
        observed: Option<CertHash>,
        expected: Option<&PkiId>,
    ) -> Result<ConnectionInfo, Error> {
        let msg = SignedMessage::from_envelope(received)?;
        let conn = msg.conn_establish().ok_or(Error::WrongType)?;
        if conn.pki_id.is_empty() {
            return Err(Error::MissingPkiId);
        }
        let pki_id = conn.pki_id.clone();
        let identity = conn.identity.clone();
        let claimed = conn.tls_cert_hash.clone();

        // Install the identity; the mapper's rejection is fatal.
        self.mapper.put(&pki_id, &identity)?;

        if let Some(expected) = expected {
            if *expected != pki_id {
                return Err(Error::PkiMismatch);
            }
        }

        let mut auth = None;
        if self_hash.is_some() && !self.skip_handshake {
            match observed {
                Some(observed) => {
                    // The digest the peer committed to must be the one the
                    // transport layer actually saw from it.
                    if claimed != observed {
                        return Err(Error::BindingMismatch);
                    }
                    msg.verify(|signature, payload| {
                        self.mapper.verify(&pki_id, signature, payload)
                    })?;
                    if !msg.envelope.cert_signature.is_empty() {
                        self.mapper
                            .verify(&pki_id, &msg.envelope.cert_signature, &claimed)?;
                    }
                    auth = Some(AuthInfo {
                        signature: msg.envelope.signature.clone(),
                        signed_bytes: msg.envelope.payload.clone(),
                    });
                }
                None => return Err(Error::MissingTransportCert),
            }
        }

        Ok(ConnectionInfo {
            pki_id,
            identity,
            auth,
        })
    }
}
