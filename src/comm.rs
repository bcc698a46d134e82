//! Facade over the connection layer.

use crate::{
    api::{Mapper, TransportSecurity},
    config::Config,
    connection::{self, Connection, ReceivedMessage},
    demux::{Demux, MessageAcceptor},
    envelope::{self, SignedMessage},
    handshake::Authenticator,
    metrics,
    store::ConnStore,
    types::{PeerIdentity, PkiId, RemotePeer},
    Error,
};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Listener, Network, Sink, Spawner, Stream};
use commonware_utils::hex;
use prometheus_client::metrics::{counter::Counter, family::Family};
use std::{
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Number of PKI-IDs buffered on the dead-endpoint stream before further
/// failures are dropped.
const DEAD_ENDPOINT_BUFFER: usize = 100;

/// Queue length of each subscriber channel returned by [Comm::accept].
const SUBSCRIBER_BUFFER: usize = 10;

/// One comm instance: owns the acceptor, the connection store, and the
/// fan-out of received messages, and exposes the send/probe/handshake
/// surface of the gossip layer.
pub struct Comm<
    Si: Sink,
    St: Stream,
    L: Listener<Si, St>,
    E: Spawner + Clock + Network<L, Si, St>,
    M: Mapper,
    S: TransportSecurity,
> {
    context: E,
    inner: Arc<Inner<M, S>>,

    _phantom_si: PhantomData<Si>,
    _phantom_st: PhantomData<St>,
    _phantom_l: PhantomData<L>,
}

struct Inner<M: Mapper, S: TransportSecurity> {
    security: S,
    pki_id: PkiId,
    authenticator: Authenticator<M>,

    dial_timeout: Duration,
    conn_timeout: Duration,
    send_buffer: usize,
    recv_buffer: usize,
    max_message_size: usize,

    store: ConnStore,
    demux: Demux,
    dead: mpsc::Sender<PkiId>,
    stopping: AtomicBool,
    acceptor: Mutex<Option<Handle<()>>>,
    subscribers: Mutex<Vec<Handle<()>>>,

    sent_messages: Family<metrics::Peer, Counter>,
    received_messages: Family<metrics::Peer, Counter>,
}

impl<
        Si: Sink,
        St: Stream,
        L: Listener<Si, St>,
        E: Spawner + Clock + Network<L, Si, St>,
        M: Mapper,
        S: TransportSecurity,
    > Clone for Comm<Si, St, L, E, M, S>
{
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            inner: self.inner.clone(),
            _phantom_si: PhantomData,
            _phantom_st: PhantomData,
            _phantom_l: PhantomData,
        }
    }
}

impl<
        Si: Sink,
        St: Stream,
        L: Listener<Si, St>,
        E: Spawner + Clock + Network<L, Si, St>,
        M: Mapper,
        S: TransportSecurity,
    > Comm<Si, St, L, E, M, S>
{
    /// Create a comm instance and start its acceptor (when `cfg.listen` is
    /// set). Returns the instance together with the dead-endpoint stream:
    /// the PKI-IDs of peers whose last send attempt failed.
    pub fn new(context: E, cfg: Config<M, S>) -> Result<(Self, mpsc::Receiver<PkiId>), Error> {
        // Install our own identity before anyone can ask about it
        let pki_id = cfg.mapper.pki_id_of(&cfg.identity);
        cfg.mapper.put(&pki_id, &cfg.identity)?;

        let sent_messages = Family::<metrics::Peer, Counter>::default();
        let received_messages = Family::<metrics::Peer, Counter>::default();
        let dropped_messages = Family::<metrics::Peer, Counter>::default();
        {
            let mut registry = cfg.registry.lock().unwrap();
            registry.register("messages_sent", "messages sent", sent_messages.clone());
            registry.register(
                "messages_received",
                "messages received",
                received_messages.clone(),
            );
            registry.register(
                "messages_dropped",
                "messages dropped on full subscriber queues",
                dropped_messages.clone(),
            );
        }

        let authenticator = Authenticator::new(
            cfg.mapper.clone(),
            pki_id.clone(),
            cfg.identity.clone(),
            cfg.skip_handshake,
            cfg.conn_timeout,
            cfg.max_message_size,
        );
        let (dead_tx, dead_rx) = mpsc::channel(DEAD_ENDPOINT_BUFFER);
        let comm = Self {
            context: context.clone(),
            inner: Arc::new(Inner {
                security: cfg.security,
                pki_id,
                authenticator,
                dial_timeout: cfg.dial_timeout,
                conn_timeout: cfg.conn_timeout,
                send_buffer: cfg.send_buffer,
                recv_buffer: cfg.recv_buffer,
                max_message_size: cfg.max_message_size,
                store: ConnStore::new(),
                demux: Demux::new(SUBSCRIBER_BUFFER, dropped_messages),
                dead: dead_tx,
                stopping: AtomicBool::new(false),
                acceptor: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                sent_messages,
                received_messages,
            }),
            _phantom_si: PhantomData,
            _phantom_st: PhantomData,
            _phantom_l: PhantomData,
        };

        if let Some(listen) = cfg.listen {
            let task = context.spawn("listener", {
                let comm = comm.clone();
                async move { comm.listen(listen).await }
            });
            *comm.inner.acceptor.lock().unwrap() = Some(task);
        }

        Ok((comm, dead_rx))
    }

    /// The PKI-ID this instance authenticates as.
    pub fn pki_id(&self) -> &PkiId {
        &self.inner.pki_id
    }

    fn stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    async fn listen(&self, address: SocketAddr) {
        let mut listener = self
            .context
            .bind(address)
            .await
            .expect("failed to bind listener");
        info!(?address, "listening");
        loop {
            let (peer_address, sink, stream) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(error = ?e, "failed to accept stream");
                    continue;
                }
            };
            if self.stopping() {
                return;
            }
            debug!(?peer_address, "accepted stream");
            self.context.spawn("stream", {
                let comm = self.clone();
                async move { comm.attach(peer_address, sink, stream).await }
            });
        }
    }

    /// Service one inbound stream: answer probes, authenticate sessions,
    /// and run the session until it dies. Public so an externally-owned
    /// server can feed its accepted streams into the comm.
    pub async fn attach(&self, address: SocketAddr, mut sink: Si, mut stream: St) {
        if self.stopping() {
            return;
        }

        // The first envelope classifies the stream
        let deadline = self.context.current() + self.inner.conn_timeout;
        let first = select! {
            _timeout = self.context.sleep_until(deadline) => {
                debug!(?address, "timed out waiting for first envelope");
                return;
            },
            result = envelope::recv_envelope(&mut stream, self.inner.max_message_size) => {
                match result {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, ?address, "failed reading first envelope");
                        return;
                    }
                }
            },
        };

        // Probes get an answer and no session
        if let Ok(msg) = SignedMessage::from_envelope(first.clone()) {
            if msg.is_ping() {
                let pong = SignedMessage::unsigned(envelope::pong());
                let _ = envelope::send_envelope(&mut sink, &pong.envelope).await;
                return;
            }
        }

        let self_hash = self.inner.security.self_cert_hash();
        let observed = self.inner.security.observed_cert_hash(address);
        let info = match self
            .inner
            .authenticator
            .inbound(&self.context, &mut sink, first, self_hash, observed)
            .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, ?address, "authentication failed");
                return;
            }
        };

        let (conn, queues) = Connection::new(info, self.inner.send_buffer);
        if !self.inner.store.on_connected(&conn) {
            // A session for this peer already exists; the newcomer loses
            // and the stream is dropped.
            debug!(peer = hex(conn.pki_id()), "duplicate session rejected");
            return;
        }
        self.service(conn, queues, sink, stream).await;
    }

    /// Run a committed session to completion, then deregister it.
    async fn service(&self, conn: Connection, queues: connection::Queues, sink: Si, stream: St) {
        let actor = connection::Actor::new(
            sink,
            stream,
            queues,
            connection::Config {
                recv_buffer: self.inner.recv_buffer,
                max_message_size: self.inner.max_message_size,
                sent_messages: self.inner.sent_messages.clone(),
                received_messages: self.inner.received_messages.clone(),
            },
        );
        let handler = {
            let inner = self.inner.clone();
            let conn = conn.clone();
            move |msg: SignedMessage| {
                inner.demux.demux(ReceivedMessage::new(msg, conn.clone()));
            }
        };
        info!(peer = hex(conn.pki_id()), "session started");
        let err = actor.run(self.context.clone(), conn.clone(), handler).await;
        debug!(error = %err, peer = hex(conn.pki_id()), "session ended");
        self.inner.store.purge(&conn);
    }

    async fn dial(&self, endpoint: SocketAddr) -> Result<(Si, St), Error> {
        select! {
            _timeout = self.context.sleep(self.inner.dial_timeout) => {
                Err(Error::DialFailed("timeout".into()))
            },
            result = self.context.dial(endpoint) => {
                result.map_err(|e| Error::DialFailed(e.to_string()))
            },
        }
    }

    /// Dial, authenticate, and start servicing a session to `peer`.
    async fn create_connection(&self, peer: RemotePeer) -> Result<Connection, Error> {
        if self.stopping() {
            return Err(Error::Stopping);
        }
        let (mut sink, mut stream) = self.dial(peer.endpoint).await?;
        let self_hash = self.inner.security.self_cert_hash();
        let observed = self.inner.security.observed_cert_hash(peer.endpoint);
        let info = self
            .inner
            .authenticator
            .outbound(
                &self.context,
                &mut sink,
                &mut stream,
                self_hash,
                observed,
                peer.pki_id.as_ref(),
            )
            .await?;

        // Service in the background; if the store ends up preferring a
        // racing inbound session, closing this one tears the task down.
        let (conn, queues) = Connection::new(info, self.inner.send_buffer);
        self.context.spawn("connection", {
            let comm = self.clone();
            let conn = conn.clone();
            async move { comm.service(conn, queues, sink, stream).await }
        });
        Ok(conn)
    }

    /// Send a message to each peer, independently and asynchronously.
    /// Delivery is best effort: a peer whose session cannot be obtained or
    /// whose send queue rejects the message is disconnected and reported on
    /// the dead-endpoint stream.
    pub fn send(&self, msg: SignedMessage, peers: &[RemotePeer]) {
        if self.stopping() || peers.is_empty() {
            return;
        }
        for peer in peers {
            self.context.spawn("send", {
                let comm = self.clone();
                let peer = peer.clone();
                let msg = msg.clone();
                async move { comm.send_to_endpoint(peer, msg).await }
            });
        }
    }

    async fn send_to_endpoint(&self, peer: RemotePeer, msg: SignedMessage) {
        if self.stopping() {
            return;
        }
        let dial = {
            let comm = self.clone();
            let peer = peer.clone();
            async move { comm.create_connection(peer).await }
        };
        match self.inner.store.get_connection(&peer, dial).await {
            Ok(conn) => {
                if let Err(e) = conn.send(msg) {
                    warn!(error = %e, peer = %peer, "failed sending to peer");
                    self.disconnect(conn.pki_id().clone());
                }
            }
            Err(e) => {
                warn!(error = %e, peer = %peer, "failed obtaining connection");
                if let Some(pki_id) = peer.pki_id {
                    self.disconnect(pki_id);
                }
            }
        }
    }

    /// Close the session and report the peer on the dead-endpoint stream.
    fn disconnect(&self, pki_id: PkiId) {
        if self.stopping() {
            return;
        }
        // Non-blocking: under sustained failure ids are dropped rather than
        // stalling the send path.
        if self.inner.dead.try_send(pki_id.clone()).is_err() {
            debug!(peer = hex(&pki_id), "dead endpoint stream full, dropping");
        }
        self.inner.store.close_by_pki_id(&pki_id);
    }

    /// Check that `peer` answers at its endpoint. No session is created and
    /// no identity is verified.
    pub async fn probe(&self, peer: &RemotePeer) -> Result<(), Error> {
        if self.stopping() {
            return Err(Error::Stopping);
        }
        let (mut sink, mut stream) = self.dial(peer.endpoint).await?;
        let ping = SignedMessage::unsigned(envelope::ping());
        envelope::send_envelope(&mut sink, &ping.envelope).await?;
        let deadline = self.context.current() + self.inner.conn_timeout;
        let reply = select! {
            _timeout = self.context.sleep_until(deadline) => {
                return Err(Error::HandshakeTimeout);
            },
            result = envelope::recv_envelope(&mut stream, self.inner.max_message_size) => {
                result?
            },
        };
        if SignedMessage::from_envelope(reply)?.is_pong() {
            Ok(())
        } else {
            Err(Error::WrongType)
        }
    }

    /// Authenticate `peer` without retaining a session. Returns the
    /// verified identity.
    pub async fn handshake(&self, peer: &RemotePeer) -> Result<PeerIdentity, Error> {
        if self.stopping() {
            return Err(Error::Stopping);
        }
        let (mut sink, mut stream) = self.dial(peer.endpoint).await?;
        let self_hash = self.inner.security.self_cert_hash();
        let observed = self.inner.security.observed_cert_hash(peer.endpoint);
        let info = self
            .inner
            .authenticator
            .outbound(
                &self.context,
                &mut sink,
                &mut stream,
                self_hash,
                observed,
                peer.pki_id.as_ref(),
            )
            .await?;
        Ok(info.identity)
    }

    /// Subscribe to inbound messages matching `acceptor`. The channel is
    /// bounded and closed when the comm stops.
    pub fn accept(&self, acceptor: MessageAcceptor) -> mpsc::Receiver<ReceivedMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if self.stopping() {
            warn!("accept called while stopping, returning closed channel");
            return rx;
        }
        let mut generic = self.inner.demux.add_channel(acceptor);
        let task = self.context.spawn("subscriber", async move {
            while let Some(msg) = generic.recv().await {
                if tx.send(msg).await.is_err() {
                    // Subscriber went away
                    return;
                }
            }
            // Demultiplexer closed; dropping tx closes the subscriber
        });
        self.inner.subscribers.lock().unwrap().push(task);
        rx
    }

    /// Force teardown of the session with `peer`, if one exists.
    pub fn close_conn(&self, peer: &RemotePeer) {
        debug!(peer = %peer, "closing connection");
        self.inner.store.close_conn(peer);
    }

    /// Stop the comm: no new work is admitted, every session and subscriber
    /// channel is closed, and every owned task is joined. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping");
        let acceptor = self.inner.acceptor.lock().unwrap().take();
        if let Some(task) = &acceptor {
            task.abort();
        }
        let connections = self.inner.store.conn_num();
        self.inner.store.shutdown();
        debug!(connections, "connection store shut down");
        self.inner.demux.close();
        let subscribers: Vec<_> = {
            let mut subscribers = self.inner.subscribers.lock().unwrap();
            subscribers.drain(..).collect()
        };
        for task in &subscribers {
            task.abort();
        }

        // Join everything we own
        if let Some(task) = acceptor {
            let _ = task.await;
        }
        for task in subscribers {
            let _ = task.await;
        }
        info!("stopped");
    }
}
