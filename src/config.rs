use crate::{
    api::{Mapper, TransportSecurity},
    types::PeerIdentity,
};
use prometheus_client::registry::Registry;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Configuration for a [crate::Comm] instance.
#[derive(Clone)]
pub struct Config<M: Mapper, S: TransportSecurity> {
    /// Identity store used to derive PKI-IDs, validate learned identities,
    /// and sign/verify handshake envelopes.
    pub mapper: M,

    /// Source of transport-certificate digests for the binding check.
    pub security: S,

    /// Our identity certificate, exchanged during every handshake.
    pub identity: PeerIdentity,

    /// Address to accept inbound streams on. `None` runs without an
    /// acceptor; inbound streams are then fed in through
    /// [crate::Comm::attach] by whoever owns the server. A port of 0 binds
    /// an ephemeral port.
    pub listen: Option<SocketAddr>,

    /// Prometheus registry for counters.
    pub registry: Arc<Mutex<Registry>>,

    /// Maximum time to establish a transport connection.
    pub dial_timeout: Duration,

    /// Maximum time to wait for the handshake reply on a new stream.
    pub conn_timeout: Duration,

    /// Accept peers without verifying the transport-certificate binding.
    pub skip_handshake: bool,

    /// Per-connection staging buffer for received envelopes.
    pub recv_buffer: usize,

    /// Per-connection outbound queue length before sends overflow.
    pub send_buffer: usize,

    /// Maximum size allowed for any envelope over any connection.
    pub max_message_size: usize,
}

impl<M: Mapper, S: TransportSecurity> Config<M, S> {
    /// Configuration with the stock timeouts and buffer sizes.
    pub fn new(mapper: M, security: S, identity: PeerIdentity, listen: Option<SocketAddr>) -> Self {
        Self {
            mapper,
            security,
            identity,
            listen,
            registry: Arc::new(Mutex::new(Registry::default())),
            dial_timeout: Duration::from_secs(3),
            conn_timeout: Duration::from_secs(2),
            skip_handshake: false,
            recv_buffer: 20,
            send_buffer: 20,
            max_message_size: 1024 * 1024,
        }
    }
}
