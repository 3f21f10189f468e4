//! Connection routing for fan-out notifications.
//!
//! Every live connection registers an outbox here. Notifications for a
//! device that is not the sender (the displaced holder, an expired
//! holder) are pushed into that device's outbox; its handler task writes
//! them to the socket in order.
//!
//! The map is behind a `std::sync::RwLock`: lookups happen inside the
//! session table's commit callbacks, which cannot await.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use pinlock_protocol::ServerMessage;
use pinlock_transport::ConnectionId;
use tokio::sync::mpsc;

pub(crate) type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Default)]
pub(crate) struct Routes {
    outboxes: RwLock<HashMap<ConnectionId, Outbox>>,
}

impl Routes {
    pub(crate) fn insert(&self, conn_id: ConnectionId, outbox: Outbox) {
        self.outboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn_id, outbox);
    }

    pub(crate) fn remove(&self, conn_id: ConnectionId) {
        self.outboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conn_id);
    }

    /// Queues `message` for `conn_id`. Returns `false` if that connection
    /// is gone.
    pub(crate) fn deliver(&self, conn_id: ConnectionId, message: ServerMessage) -> bool {
        let outboxes = self.outboxes.read().unwrap_or_else(PoisonError::into_inner);
        match outboxes.get(&conn_id) {
            Some(outbox) => outbox.send(message).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.outboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_reaches_registered_outbox() {
        let routes = Routes::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        routes.insert(ConnectionId::new(1), tx);

        assert!(routes.deliver(ConnectionId::new(1), ServerMessage::HeartbeatAck {}));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::HeartbeatAck {});
    }

    #[test]
    fn test_deliver_to_unknown_connection_is_false() {
        let routes = Routes::default();
        assert!(!routes.deliver(ConnectionId::new(9), ServerMessage::HeartbeatAck {}));
    }

    #[test]
    fn test_remove_stops_delivery() {
        let routes = Routes::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        routes.insert(ConnectionId::new(1), tx);
        routes.remove(ConnectionId::new(1));

        assert_eq!(routes.len(), 0);
        assert!(!routes.deliver(ConnectionId::new(1), ServerMessage::HeartbeatAck {}));
    }
}
