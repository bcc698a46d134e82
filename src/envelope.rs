//! Signed envelope carried on every stream.

use crate::{wire, Error};
use bytes::Bytes;
use commonware_runtime::{Sink, Stream};
use prost::Message as _;

/// A typed message together with the envelope it travels in.
///
/// The envelope payload is the serialized message; the signature (when one
/// exists) is detached and covers exactly the payload bytes, so the pair
/// round-trips without re-serialization.
#[derive(Clone, Debug)]
pub struct SignedMessage {
    pub message: wire::Message,
    pub envelope: wire::Envelope,
}

impl SignedMessage {
    /// Wrap a message in an envelope without signing it.
    pub fn unsigned(message: wire::Message) -> Self {
        let payload: Bytes = message.encode_to_vec().into();
        Self {
            message,
            envelope: wire::Envelope {
                payload,
                signature: Bytes::new(),
                cert_signature: Bytes::new(),
            },
        }
    }

    /// Wrap a message in an envelope signed over its payload bytes.
    pub fn sign<F>(message: wire::Message, signer: F) -> Result<Self, Error>
    where
        F: FnOnce(&[u8]) -> Result<Bytes, Error>,
    {
        let payload: Bytes = message.encode_to_vec().into();
        let signature = signer(&payload)?;
        Ok(Self {
            message,
            envelope: wire::Envelope {
                payload,
                signature,
                cert_signature: Bytes::new(),
            },
        })
    }

    /// Decode the typed message out of a received envelope.
    pub fn from_envelope(envelope: wire::Envelope) -> Result<Self, Error> {
        let message =
            wire::Message::decode(envelope.payload.clone()).map_err(Error::UnableToDecode)?;
        Ok(Self { message, envelope })
    }

    /// Check the envelope signature with the supplied verifier, which is
    /// called with the signature and the signed bytes.
    pub fn verify<F>(&self, verifier: F) -> Result<(), Error>
    where
        F: FnOnce(&[u8], &[u8]) -> Result<(), Error>,
    {
        if self.envelope.signature.is_empty() {
            return Err(Error::MissingSignature);
        }
        verifier(&self.envelope.signature, &self.envelope.payload)
    }

    pub fn conn_establish(&self) -> Option<&wire::ConnEstablish> {
        match &self.message.payload {
            Some(wire::message::Payload::ConnEstablish(conn)) => Some(conn),
            _ => None,
        }
    }

    pub fn gossip(&self) -> Option<&Bytes> {
        match &self.message.payload {
            Some(wire::message::Payload::Gossip(data)) => Some(data),
            _ => None,
        }
    }

    pub fn is_ping(&self) -> bool {
        matches!(self.message.payload, Some(wire::message::Payload::Ping(_)))
    }

    pub fn is_pong(&self) -> bool {
        matches!(self.message.payload, Some(wire::message::Payload::Pong(_)))
    }
}

/// Build a message carrying an opaque gossip payload.
pub fn gossip(data: Bytes) -> wire::Message {
    wire::Message {
        nonce: 0,
        payload: Some(wire::message::Payload::Gossip(data)),
    }
}

pub(crate) fn ping() -> wire::Message {
    wire::Message {
        nonce: 0,
        payload: Some(wire::message::Payload::Ping(wire::Ping {})),
    }
}

pub(crate) fn pong() -> wire::Message {
    wire::Message {
        nonce: 0,
        payload: Some(wire::message::Payload::Pong(wire::Pong {})),
    }
}

pub(crate) async fn send_envelope<Si: Sink>(
    sink: &mut Si,
    envelope: &wire::Envelope,
) -> Result<(), Error> {
    sink.send(Bytes::from(envelope.encode_to_vec()))
        .await
        .map_err(|_| Error::StreamBroken)
}

pub(crate) async fn recv_envelope<St: Stream>(
    stream: &mut St,
    max_message_size: usize,
) -> Result<wire::Envelope, Error> {
    let msg = stream.recv().await.map_err(|_| Error::StreamBroken)?;
    if msg.len() > max_message_size {
        return Err(Error::MessageTooLarge(msg.len()));
    }
    wire::Envelope::decode(msg).map_err(Error::UnableToDecode)
}
