//! One authenticated peer session.

use crate::{
    envelope::{self, SignedMessage},
    metrics,
    types::{ConnectionInfo, PkiId},
    wire, Error,
};
use commonware_macros::select;
use commonware_runtime::{Sink, Spawner, Stream};
use prometheus_client::metrics::{counter::Counter, family::Family};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;

pub(crate) struct Config {
    pub recv_buffer: usize,
    pub max_message_size: usize,
    pub sent_messages: Family<metrics::Peer, Counter>,
    pub received_messages: Family<metrics::Peer, Counter>,
}

/// Handle to a live session. Cheap to clone; the stream itself is owned by
/// the session's [Actor].
#[derive(Clone)]
pub(crate) struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    info: ConnectionInfo,
    outbound: mpsc::Sender<SignedMessage>,
    kill: mpsc::Sender<()>,
    closed: AtomicBool,
}

/// Receiver halves of a connection's queues, consumed by its [Actor].
pub(crate) struct Queues {
    outbound: mpsc::Receiver<SignedMessage>,
    kill: mpsc::Receiver<()>,
}

impl Connection {
    pub fn new(info: ConnectionInfo, send_buffer: usize) -> (Self, Queues) {
        let (outbound_tx, outbound_rx) = mpsc::channel(send_buffer);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        (
            Self {
                inner: Arc::new(Inner {
                    info,
                    outbound: outbound_tx,
                    kill: kill_tx,
                    closed: AtomicBool::new(false),
                }),
            },
            Queues {
                outbound: outbound_rx,
                kill: kill_rx,
            },
        )
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }

    pub fn pki_id(&self) -> &PkiId {
        &self.inner.info.pki_id
    }

    /// Enqueue a message for the send worker. Never blocks: a full queue is
    /// reported as [Error::SendOverflow] and the queue is left intact.
    pub fn send(&self, msg: SignedMessage) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::StreamBroken);
        }
        self.inner.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::SendOverflow,
            mpsc::error::TrySendError::Closed(_) => Error::StreamBroken,
        })
    }

    /// Signal the session to shut down. Idempotent; the second call is a
    /// no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.kill.try_send(());
    }

    /// Whether `other` is a handle to this same session.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// An inbound message together with the session it arrived on, so a
/// subscriber can reply on the same stream.
#[derive(Clone)]
pub struct ReceivedMessage {
    msg: SignedMessage,
    conn: Connection,
}

impl ReceivedMessage {
    pub(crate) fn new(msg: SignedMessage, conn: Connection) -> Self {
        Self { msg, conn }
    }

    pub fn message(&self) -> &SignedMessage {
        &self.msg
    }

    pub fn info(&self) -> &ConnectionInfo {
        self.conn.info()
    }

    /// Send a reply on the session this message arrived on. Best effort:
    /// fails if the session has died or its send queue is full.
    pub fn respond(&self, message: wire::Message) -> Result<(), Error> {
        self.conn.send(SignedMessage::unsigned(message))
    }
}

/// Owns the stream and services it with one send worker and one read
/// worker until either fails or the session is closed.
pub(crate) struct Actor<Si: Sink, St: Stream> {
    sink: Si,
    stream: St,
    queues: Queues,
    recv_buffer: usize,
    max_message_size: usize,
    sent_messages: Family<metrics::Peer, Counter>,
    received_messages: Family<metrics::Peer, Counter>,
}

impl<Si: Sink, St: Stream> Actor<Si, St> {
    pub fn new(sink: Si, stream: St, queues: Queues, cfg: Config) -> Self {
        Self {
            sink,
            stream,
            queues,
            recv_buffer: cfg.recv_buffer,
            max_message_size: cfg.max_message_size,
            sent_messages: cfg.sent_messages,
            received_messages: cfg.received_messages,
        }
    }

    /// Service the session. Returns the error that ended it; every exit
    /// path closes the connection handle and both workers.
    pub async fn run<E, H>(self, context: E, connection: Connection, handler: H) -> Error
    where
        E: Spawner,
        H: Fn(SignedMessage) + Send + Sync + 'static,
    {
        let peer = metrics::Peer::new(connection.pki_id());
        let Queues {
            mut outbound,
            mut kill,
        } = self.queues;

        // Send worker: drain the outbound queue onto the sink in order.
        let mut sink = self.sink;
        let sent_messages = self.sent_messages;
        let sent_peer = peer.clone();
        let mut send_worker = context.spawn("connection_send", async move {
            while let Some(msg) = outbound.recv().await {
                envelope::send_envelope(&mut sink, &msg.envelope).await?;
                sent_messages.get_or_create(&sent_peer).inc();
            }
            Err::<(), Error>(Error::StreamBroken)
        });

        // Read worker: stage received envelopes for dispatch.
        let (staging_tx, mut staging) = mpsc::channel(self.recv_buffer);
        let mut stream = self.stream;
        let max_message_size = self.max_message_size;
        let mut read_worker = context.spawn("connection_read", async move {
            loop {
                let received = envelope::recv_envelope(&mut stream, max_message_size).await?;
                let msg = SignedMessage::from_envelope(received)?;
                if staging_tx.send(msg).await.is_err() {
                    // Dispatch loop exited first
                    return Ok::<(), Error>(());
                }
            }
        });

        // Dispatch staged messages to the handler until something dies.
        let err = loop {
            select! {
                _killed = kill.recv() => {
                    break Error::Closed;
                },
                sender = &mut send_worker => {
                    break match sender {
                        Ok(Err(e)) => e,
                        _ => Error::StreamBroken,
                    };
                },
                msg = staging.recv() => {
                    match msg {
                        Some(msg) => {
                            self.received_messages.get_or_create(&peer).inc();
                            handler(msg);
                        }
                        None => {
                            break match (&mut read_worker).await {
                                Ok(Err(e)) => e,
                                _ => Error::StreamBroken,
                            };
                        }
                    }
                },
            }
        };

        send_worker.abort();
        read_worker.abort();
        connection.close();
        err
    }
}
