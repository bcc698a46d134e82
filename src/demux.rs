//! Single-producer fan-out of received messages to subscribers.

use crate::{connection::ReceivedMessage, metrics};
use prometheus_client::metrics::{counter::Counter, family::Family};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Predicate deciding whether a subscriber wants a message.
pub type MessageAcceptor = Arc<dyn Fn(&ReceivedMessage) -> bool + Send + Sync>;

/// Routes every incoming message to the subscribers whose predicates match.
///
/// Delivery never blocks: each subscriber has a bounded queue and messages
/// to a full queue are dropped (and counted). A slow subscriber therefore
/// cannot stall delivery to the others.
pub(crate) struct Demux {
    buffer: usize,
    subscribers: Mutex<Option<Vec<Subscriber>>>,
    dropped: Family<metrics::Peer, Counter>,
}

struct Subscriber {
    acceptor: MessageAcceptor,
    sender: mpsc::Sender<ReceivedMessage>,
}

impl Demux {
    pub fn new(buffer: usize, dropped: Family<metrics::Peer, Counter>) -> Self {
        Self {
            buffer,
            subscribers: Mutex::new(Some(Vec::new())),
            dropped,
        }
    }

    /// Register a subscriber. The returned channel yields every message the
    /// predicate accepts until the demultiplexer is closed; if the
    /// demultiplexer is already closed, the channel is closed on arrival.
    pub fn add_channel(&self, acceptor: MessageAcceptor) -> mpsc::Receiver<ReceivedMessage> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let mut subscribers = self.subscribers.lock().unwrap();
        match subscribers.as_mut() {
            Some(subscribers) => subscribers.push(Subscriber { acceptor, sender }),
            None => debug!("subscriber registered after close"),
        }
        receiver
    }

    /// Offer a message to every subscriber whose predicate matches.
    pub fn demux(&self, msg: ReceivedMessage) {
        let subscribers = self.subscribers.lock().unwrap();
        let Some(subscribers) = subscribers.as_ref() else {
            return;
        };
        for subscriber in subscribers {
            if !(subscriber.acceptor)(&msg) {
                continue;
            }
            if subscriber.sender.try_send(msg.clone()).is_err() {
                self.dropped
                    .get_or_create(&metrics::Peer::new(&msg.info().pki_id))
                    .inc();
            }
        }
    }

    /// Close every subscriber channel and reject further registration.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::Connection,
        envelope::{self, SignedMessage},
        types::ConnectionInfo,
    };
    use bytes::Bytes;

    fn message(data: &'static str) -> ReceivedMessage {
        let info = ConnectionInfo {
            pki_id: Bytes::from_static(&[1u8; 32]),
            identity: Bytes::from_static(&[2u8; 32]),
            auth: None,
        };
        let (conn, _queues) = Connection::new(info, 1);
        ReceivedMessage::new(
            SignedMessage::unsigned(envelope::gossip(Bytes::from(data))),
            conn,
        )
    }

    #[test]
    fn test_predicate_routing() {
        let demux = Demux::new(8, Family::default());
        let mut all = demux.add_channel(Arc::new(|_| true));
        let mut none = demux.add_channel(Arc::new(|_| false));
        let mut hello = demux.add_channel(Arc::new(|msg: &ReceivedMessage| {
            msg.message().gossip().map(|d| d.as_ref()) == Some(&b"hello"[..])
        }));

        demux.demux(message("hello"));
        demux.demux(message("world"));

        assert_eq!(
            all.try_recv().unwrap().message().gossip().unwrap().as_ref(),
            b"hello"
        );
        assert_eq!(
            all.try_recv().unwrap().message().gossip().unwrap().as_ref(),
            b"world"
        );
        assert!(none.try_recv().is_err());
        assert_eq!(
            hello
                .try_recv()
                .unwrap()
                .message()
                .gossip()
                .unwrap()
                .as_ref(),
            b"hello"
        );
        assert!(hello.try_recv().is_err());
    }

    #[test]
    fn test_drop_on_full() {
        let dropped = Family::<metrics::Peer, Counter>::default();
        let demux = Demux::new(1, dropped.clone());
        let mut subscriber = demux.add_channel(Arc::new(|_| true));

        demux.demux(message("first"));
        demux.demux(message("second"));

        assert_eq!(
            subscriber
                .try_recv()
                .unwrap()
                .message()
                .gossip()
                .unwrap()
                .as_ref(),
            b"first"
        );
        assert!(subscriber.try_recv().is_err());
        let peer = metrics::Peer::new(&Bytes::from_static(&[1u8; 32]));
        assert_eq!(dropped.get_or_create(&peer).get(), 1);
    }

    #[test]
    fn test_close() {
        let demux = Demux::new(8, Family::default());
        let mut before = demux.add_channel(Arc::new(|_| true));
        demux.close();

        // Existing subscribers observe the close
        assert!(matches!(
            before.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // New subscribers are closed immediately, and delivery is a no-op
        let mut after = demux.add_channel(Arc::new(|_| true));
        demux.demux(message("late"));
        assert!(matches!(
            after.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
