//! Connection Registry
//!
//! Authoritative set of connections known to one service.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::protocol::HandshakeReply;
use crate::queue::MessageQueue;
use crate::service::OutboxEntry;
use crate::transport::{Connection, MessagePrefix, MessageType, OutboundFrame};

pub struct ConnectionRegistry {
    /// Approved connections
    active: RwLock<Vec<Arc<Connection>>>,
    /// Outbound requests waiting for the peer's verdict
    pending: RwLock<Vec<Arc<Connection>>>,
    outbox: Arc<MessageQueue<OutboxEntry>>,
    local_port: u16,
}

impl ConnectionRegistry {
    pub fn new(outbox: Arc<MessageQueue<OutboxEntry>>, local_port: u16) -> Self {
        ConnectionRegistry {
            active: RwLock::new(Vec::new()),
            pending: RwLock::new(Vec::new()),
            outbox,
            local_port,
        }
    }

    /// Add an approved connection. Returns false if it is already registered.
    pub fn add_connection(&self, connection: Arc<Connection>) -> bool {
        remove(&mut write(&self.pending), &connection);

        let mut active = write(&self.active);
        if active.iter().any(|c| c.id() == connection.id()) {
            return false;
        }
        tracing::info!(
            "Registered connection {} to {}",
            connection.id(),
            connection.endpoint()
        );
        active.push(connection);
        true
    }

    /// Mark the connection rejected, forget it, and tell the peer why.
    ///
    /// Returns false, leaving the registry and the peer untouched, once the
    /// connection already has a verdict (approved or rejected).
    pub fn reject_connection(&self, connection: &Arc<Connection>, reason: &str) -> bool {
        if !connection.mark_rejected() {
            return false;
        }
        remove(&mut write(&self.pending), connection);
        remove(&mut write(&self.active), connection);

        tracing::info!(
            "Rejecting connection {} to {}: {}",
            connection.id(),
            connection.endpoint(),
            reason
        );
        self.outbox.push(OutboxEntry {
            frame: OutboundFrame {
                prefix: MessagePrefix::handshake(MessageType::ConnectionRejected),
                payload: HandshakeReply::rejected(self.local_port, reason).encode(),
            },
            targets: vec![connection.clone()],
        });
        true
    }

    pub fn remove_connection(&self, connection: &Arc<Connection>) -> bool {
        let from_pending = remove(&mut write(&self.pending), connection);
        let from_active = remove(&mut write(&self.active), connection);
        from_pending || from_active
    }

    /// Snapshot of the approved connections
    pub fn get_connections(&self) -> Vec<Arc<Connection>> {
        read(&self.active).clone()
    }

    pub fn track_pending(&self, connection: Arc<Connection>) {
        write(&self.pending).push(connection);
    }

    /// Remove and return the pending request addressed to `peer`
    pub fn take_pending(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        let mut pending = write(&self.pending);
        let index = pending.iter().position(|c| same_peer(c.endpoint(), peer))?;
        Some(pending.remove(index))
    }

    /// Forget every connection, returning them so the caller can dispose them
    pub fn clear(&self) -> Vec<Arc<Connection>> {
        let mut all = std::mem::take(&mut *write(&self.pending));
        all.append(&mut write(&self.active));
        all
    }
}

/// Endpoints match on port and address; any two loopback addresses count as the same host.
fn same_peer(endpoint: SocketAddr, peer: SocketAddr) -> bool {
    endpoint.port() == peer.port()
        && (endpoint.ip() == peer.ip() || (endpoint.ip().is_loopback() && peer.ip().is_loopback()))
}

fn remove(list: &mut Vec<Arc<Connection>>, connection: &Arc<Connection>) -> bool {
    let before = list.len();
    list.retain(|c| c.id() != connection.id());
    list.len() != before
}

fn read(lock: &RwLock<Vec<Arc<Connection>>>) -> RwLockReadGuard<'_, Vec<Arc<Connection>>> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write(lock: &RwLock<Vec<Arc<Connection>>>) -> RwLockWriteGuard<'_, Vec<Arc<Connection>>> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionStatus;

    fn registry() -> (ConnectionRegistry, Arc<MessageQueue<OutboxEntry>>) {
        let outbox = Arc::new(MessageQueue::new());
        (ConnectionRegistry::new(outbox.clone(), 5000), outbox)
    }

    fn conn(port: u16) -> Arc<Connection> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Arc::new(Connection::incoming(addr))
    }

    #[test]
    fn test_add_once() {
        let (registry, _) = registry();
        let c = conn(7000);
        assert!(registry.add_connection(c.clone()));
        assert!(!registry.add_connection(c.clone()));
        assert_eq!(registry.get_connections().len(), 1);
    }

    #[test]
    fn test_reject_notifies_peer() {
        let (registry, outbox) = registry();
        let c = conn(7001);
        assert!(registry.reject_connection(&c, "busy"));
        assert_eq!(c.status(), ConnectionStatus::Rejected);
        assert!(registry.get_connections().is_empty());

        let entry = outbox.pop().unwrap();
        assert_eq!(entry.frame.prefix.message_type, MessageType::ConnectionRejected);
        assert_eq!(entry.targets[0].id(), c.id());
        let reply = HandshakeReply::decode(entry.frame.payload).unwrap();
        assert_eq!(reply.listen_port, 5000);
        assert_eq!(reply.reason, "busy");

        assert!(!registry.reject_connection(&c, "again"));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_reject_after_approval_is_ignored() {
        let (registry, outbox) = registry();
        let c = conn(7008);
        assert!(c.mark_connected());
        registry.add_connection(c.clone());

        assert!(!registry.reject_connection(&c, "changed my mind"));
        assert_eq!(c.status(), ConnectionStatus::Connected);
        assert_eq!(registry.get_connections().len(), 1);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let (registry, _) = registry();
        registry.add_connection(conn(7002));
        let snapshot = registry.get_connections();
        registry.add_connection(conn(7003));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.get_connections().len(), 2);
    }

    #[test]
    fn test_pending_lookup() {
        let (registry, _) = registry();
        let c = conn(7004);
        registry.track_pending(c.clone());

        assert!(registry.take_pending(SocketAddr::from(([127, 0, 0, 1], 7005))).is_none());
        let found = registry.take_pending(SocketAddr::from(([127, 0, 0, 2], 7004))).unwrap();
        assert_eq!(found.id(), c.id());
        assert!(registry.take_pending(SocketAddr::from(([127, 0, 0, 1], 7004))).is_none());
    }

    #[test]
    fn test_remove_and_clear() {
        let (registry, _) = registry();
        let a = conn(7006);
        let b = conn(7007);
        registry.add_connection(a.clone());
        registry.track_pending(b.clone());

        assert!(registry.remove_connection(&a));
        assert!(!registry.remove_connection(&a));
        assert_eq!(registry.clear().len(), 1);
        assert!(registry.take_pending(b.endpoint()).is_none());
    }
}
