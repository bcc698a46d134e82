//! Per-identity connection registry.

use crate::{
    connection::Connection,
    types::{PkiId, RemotePeer},
    Error,
};
use commonware_utils::hex;
use std::{collections::HashMap, future::Future, sync::Mutex};
use tokio::sync::oneshot;
use tracing::debug;

/// Registry enforcing at most one live session per PKI-ID.
///
/// Concurrent dials to the same identity coalesce onto a single attempt:
/// the first caller performs the dial (outside the lock) and everyone else
/// waits on a latch for its outcome. Inbound sessions commit through
/// [ConnStore::on_connected], which rejects a newcomer whenever a session
/// for that identity already exists.
pub(crate) struct ConnStore {
    inner: Mutex<Inner>,
}

struct Inner {
    conns: HashMap<PkiId, Connection>,
    pending: HashMap<PkiId, Vec<oneshot::Sender<Result<Connection, Error>>>>,
    shutdown: bool,
}

impl ConnStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                conns: HashMap::new(),
                pending: HashMap::new(),
                shutdown: false,
            }),
        }
    }

    /// Return the session for `peer`, dialing one with `dial` if none
    /// exists. `dial` is awaited outside the lock and only when this caller
    /// owns the attempt.
    pub async fn get_connection<F>(&self, peer: &RemotePeer, dial: F) -> Result<Connection, Error>
    where
        F: Future<Output = Result<Connection, Error>>,
    {
        let pki_id = match &peer.pki_id {
            Some(pki_id) => pki_id.clone(),
            None => {
                // Unknown identity: nothing to coalesce on until the
                // handshake reveals who answered.
                let conn = dial.await?;
                return self.commit(conn);
            }
        };

        // Fast path or join an in-flight dial
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return Err(Error::Stopping);
            }
            if let Some(conn) = inner.conns.get(&pki_id) {
                return Ok(conn.clone());
            }
            match inner.pending.get_mut(&pki_id) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inner.pending.insert(pki_id.clone(), Vec::new());
                    None
                }
            }
        };
        if let Some(rx) = waiter {
            return rx.await.unwrap_or(Err(Error::Stopping));
        }

        // We own the dial
        debug!(peer = hex(&pki_id), "dialing peer");
        let result = dial.await;
        let result = match result {
            Ok(conn) => self.commit(conn),
            Err(e) => Err(e),
        };
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.remove(&pki_id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    /// Register a freshly established session, deferring to any session that
    /// won the race for this identity (the loser is closed).
    fn commit(&self, conn: Connection) -> Result<Connection, Error> {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                Err(Error::Stopping)
            } else if let Some(existing) = inner.conns.get(conn.pki_id()) {
                Ok(existing.clone())
            } else {
                inner.conns.insert(conn.pki_id().clone(), conn.clone());
                return Ok(conn);
            }
        };
        conn.close();
        result
    }

    /// Commit an inbound session. Returns false (and the caller closes the
    /// stream) if a session for this identity already exists.
    pub fn on_connected(&self, conn: &Connection) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown || inner.conns.contains_key(conn.pki_id()) {
            return false;
        }
        inner.conns.insert(conn.pki_id().clone(), conn.clone());
        true
    }

    pub fn get(&self, pki_id: &PkiId) -> Option<Connection> {
        self.inner.lock().unwrap().conns.get(pki_id).cloned()
    }

    /// Remove and close the session for `pki_id`, if any. Idempotent.
    pub fn close_by_pki_id(&self, pki_id: &PkiId) {
        let conn = self.inner.lock().unwrap().conns.remove(pki_id);
        if let Some(conn) = conn {
            debug!(peer = hex(pki_id), "closing connection");
            conn.close();
        }
    }

    /// Remove `conn` only if it is still the registered session for its
    /// identity. Used by a dying session to deregister itself without
    /// clobbering a replacement.
    pub fn purge(&self, conn: &Connection) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.conns.get(conn.pki_id()) {
            if existing.same(conn) {
                inner.conns.remove(conn.pki_id());
            }
        }
    }

    pub fn close_conn(&self, peer: &RemotePeer) {
        if let Some(pki_id) = &peer.pki_id {
            self.close_by_pki_id(pki_id);
        }
    }

    pub fn conn_num(&self) -> usize {
        self.inner.lock().unwrap().conns.len()
    }

    /// Close every session and fail every in-flight dial. Further calls
    /// return [Error::Stopping].
    pub fn shutdown(&self) {
        let (conns, pending) = {
            let mut inner = self.inner.lock().unwrap();
            inner.shutdown = true;
            (
                std::mem::take(&mut inner.conns),
                std::mem::take(&mut inner.pending),
            )
        };
        for conn in conns.into_values() {
            conn.close();
        }
        for waiters in pending.into_values() {
            for waiter in waiters {
                let _ = waiter.send(Err(Error::Stopping));
            }
        }
    }
}
