//! Registry of open connections.

use std::sync::Arc;

use dashmap::DashMap;
use parley_core::ids::ConnectionId;
use parley_core::ServerFrame;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::websocket::connection::{Connection, OutboundText};

/// Tracks every open connection by id.
///
/// Safe to use from any task; `unregister` may race with `broadcast`.
#[derive(Default)]
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport and return its fresh id. Never fails.
    pub fn register(&self, transport: mpsc::Sender<OutboundText>) -> ConnectionId {
        let id = ConnectionId::new();
        let connection = Arc::new(Connection::new(id.clone(), transport));
        let _ = self.connections.insert(id.clone(), connection);
        debug!(connection_id = %id, "connection registered");
        id
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id);
        if let Some((_, connection)) = &removed {
            debug!(
                connection_id = %id,
                dropped_frames = connection.dropped_frames(),
                "connection unregistered"
            );
        }
        removed.is_some()
    }

    /// Best-effort send to every connection. Returns how many accepted it.
    pub fn broadcast(&self, frame: &ServerFrame) -> usize {
        let text = match frame.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(frame_type = frame.frame_type(), error = %e, "failed to serialize broadcast");
                return 0;
            }
        };
        // Snapshot first so no shard lock is held while sending.
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut delivered = 0;
        for connection in targets {
            if connection.send(Arc::clone(&text)) {
                delivered += 1;
            } else {
                warn!(
                    connection_id = %connection.id,
                    frame_type = frame.frame_type(),
                    "broadcast delivery failed"
                );
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<OutboundText>, mpsc::Receiver<OutboundText>) {
        mpsc::channel(8)
    }

    #[test]
    fn register_assigns_fresh_ids() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        let a = registry.register(tx.clone());
        let b = registry.register(tx);
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn lookup_after_unregister_is_absent() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register(tx);
        assert!(registry.lookup(&id).is_some());
        assert!(registry.unregister(&id));
        assert!(registry.lookup(&id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn double_unregister_is_noop() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register(tx);
        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert!(!registry.unregister(&ConnectionId::new()));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn broadcast_skips_failed_connections() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, rx2) = channel();
        let (tx3, mut rx3) = channel();
        let _ = registry.register(tx1);
        let closed = registry.register(tx2);
        let _ = registry.register(tx3);
        drop(rx2);

        let delivered = registry.broadcast(&ServerFrame::Pong);
        assert_eq!(delivered, 2);
        assert_eq!(&*rx1.try_recv().unwrap(), r#"{"type":"pong"}"#);
        assert_eq!(&*rx3.try_recv().unwrap(), r#"{"type":"pong"}"#);
        assert_eq!(registry.lookup(&closed).unwrap().dropped_frames(), 1);
    }

    #[test]
    fn broadcast_to_empty_registry() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.broadcast(&ServerFrame::Pong), 0);
    }

    #[tokio::test]
    async fn concurrent_register_and_unregister() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                let id = registry.register(tx);
                tokio::task::yield_now().await;
                assert!(registry.unregister(&id));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.count(), 0);
    }
}
