//! Connection registry
//!
//! Process-wide table mapping an authenticated identity to the set of its
//! currently open connections. An identity may own zero, one, or many
//! connections (multiple devices/tabs). Safe for concurrent register,
//! unregister, and fan-out without a global lock serializing unrelated
//! identities.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound queue depth per connection. Chat-rate traffic never comes close;
/// a full queue means the peer has stopped draining its socket.
const OUTBOUND_BUFFER: usize = 64;

/// Frame pushed to a connection's writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized server event, shared across the whole fan-out
    Frame(Arc<str>),
    /// Normal-closure request; the writer closes the socket and stops
    Close,
}

/// Sender half of one live connection's outbound queue
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver its writer task drains
    pub fn new() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Non-blocking enqueue; `false` if the connection is gone or backed up
    fn push(&self, frame: Outbound) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

/// Identity -> live connections, with per-identity atomic updates
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Vec<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the identity's set. Registering the same
    /// connection twice is a no-op, so a frame is never delivered twice to
    /// one connection.
    pub fn register(&self, identity: Uuid, handle: ConnectionHandle) {
        let mut entry = self.connections.entry(identity).or_default();
        if entry.iter().any(|c| c.id == handle.id) {
            return;
        }
        entry.push(handle);
        debug!(%identity, connections = entry.len(), "connection registered");
    }

    /// Remove a connection; identities with no remaining connections are
    /// dropped from the table entirely.
    pub fn unregister(&self, identity: Uuid, connection_id: Uuid) {
        if let Entry::Occupied(mut occupied) = self.connections.entry(identity) {
            occupied.get_mut().retain(|c| c.id != connection_id);
            if occupied.get().is_empty() {
                occupied.remove();
            } else {
                debug!(%identity, connections = occupied.get().len(), "connection unregistered");
            }
        }
    }

    /// Deliver a serialized payload to every live connection of the identity.
    /// A connection that cannot accept the frame is skipped; it will
    /// unregister itself through its own lifecycle.
    pub fn send_to(&self, identity: Uuid, payload: &Arc<str>) {
        let Some(handles) = self.connections.get(&identity) else {
            return;
        };
        for handle in handles.iter() {
            if !handle.push(Outbound::Frame(Arc::clone(payload))) {
                warn!(%identity, conn_id = %handle.id, "dropping frame for unresponsive connection");
            }
        }
    }

    /// Close every live connection with a normal-closure signal and clear the
    /// table. Used only at process shutdown.
    pub fn shutdown_all(&self) {
        let mut closed = 0usize;
        for entry in self.connections.iter() {
            for handle in entry.value() {
                if handle.push(Outbound::Close) {
                    closed += 1;
                }
            }
        }
        self.connections.clear();
        debug!(closed, "registry shut down");
    }

    /// Number of live connections across all identities
    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
    }

    /// Whether the identity has at least one live connection
    pub fn is_connected(&self, identity: Uuid) -> bool {
        self.connections.contains_key(&identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[tokio::test]
    async fn send_reaches_every_connection_of_identity() {
        let registry = ConnectionRegistry::new();
        let identity = Uuid::new_v4();
        let (c1, mut rx1) = ConnectionHandle::new();
        let (c2, mut rx2) = ConnectionHandle::new();
        registry.register(identity, c1);
        registry.register(identity, c2);

        registry.send_to(identity, &frame("hello"));

        assert!(matches!(rx1.try_recv().unwrap(), Outbound::Frame(p) if &*p == "hello"));
        assert!(matches!(rx2.try_recv().unwrap(), Outbound::Frame(p) if &*p == "hello"));
    }

    #[tokio::test]
    async fn send_does_not_cross_identities() {
        let registry = ConnectionRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (ca, mut rx_a) = ConnectionHandle::new();
        let (cb, mut rx_b) = ConnectionHandle::new();
        registry.register(alice, ca);
        registry.register(bob, cb);

        registry.send_to(alice, &frame("for alice"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn register_same_connection_twice_is_noop() {
        let registry = ConnectionRegistry::new();
        let identity = Uuid::new_v4();
        let (conn, mut rx) = ConnectionHandle::new();
        registry.register(identity, conn.clone());
        registry.register(identity, conn);

        assert_eq!(registry.connection_count(), 1);
        registry.send_to(identity, &frame("once"));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_last_connection_drops_entry() {
        let registry = ConnectionRegistry::new();
        let identity = Uuid::new_v4();
        let (conn, _rx) = ConnectionHandle::new();
        let conn_id = conn.id();
        registry.register(identity, conn);
        assert!(registry.is_connected(identity));

        registry.unregister(identity, conn_id);

        assert!(!registry.is_connected(identity));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn unregister_keeps_siblings() {
        let registry = ConnectionRegistry::new();
        let identity = Uuid::new_v4();
        let (c1, _rx1) = ConnectionHandle::new();
        let (c2, mut rx2) = ConnectionHandle::new();
        let c1_id = c1.id();
        registry.register(identity, c1);
        registry.register(identity, c2);

        registry.unregister(identity, c1_id);

        assert_eq!(registry.connection_count(), 1);
        registry.send_to(identity, &frame("still here"));
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregister_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.unregister(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn dead_connection_does_not_block_siblings() {
        let registry = ConnectionRegistry::new();
        let identity = Uuid::new_v4();
        let (dead, rx_dead) = ConnectionHandle::new();
        let (live, mut rx_live) = ConnectionHandle::new();
        registry.register(identity, dead);
        registry.register(identity, live);
        drop(rx_dead);

        registry.send_to(identity, &frame("fan-out"));

        assert!(matches!(rx_live.try_recv().unwrap(), Outbound::Frame(_)));
    }

    #[tokio::test]
    async fn shutdown_all_closes_everyone_and_clears() {
        let registry = ConnectionRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (ca, mut rx_a) = ConnectionHandle::new();
        let (cb, mut rx_b) = ConnectionHandle::new();
        registry.register(alice, ca);
        registry.register(bob, cb);

        registry.shutdown_all();

        assert!(matches!(rx_a.try_recv().unwrap(), Outbound::Close));
        assert!(matches!(rx_b.try_recv().unwrap(), Outbound::Close));
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.is_connected(alice));
    }

    #[tokio::test]
    async fn fanout_shares_one_serialized_payload() {
        let registry = ConnectionRegistry::new();
        let identity = Uuid::new_v4();
        let (c1, mut rx1) = ConnectionHandle::new();
        let (c2, mut rx2) = ConnectionHandle::new();
        registry.register(identity, c1);
        registry.register(identity, c2);

        let payload = frame("shared");
        registry.send_to(identity, &payload);

        let Outbound::Frame(p1) = rx1.try_recv().unwrap() else {
            panic!("expected frame")
        };
        let Outbound::Frame(p2) = rx2.try_recv().unwrap() else {
            panic!("expected frame")
        };
        assert!(Arc::ptr_eq(&p1, &p2));
    }
}
