use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use courier_types::events::ServerEvent;
use courier_types::models::DigestRecipient;

/// In-memory registry of which users and devices currently hold a live
/// connection. The directory holds send handles only; the connection task
/// owns its session state and unregisters itself on disconnect.
///
/// Every operation acquires the lock exactly once, so logically-concurrent
/// register/unregister calls can never interleave between a read and its
/// dependent write.
#[derive(Clone, Default)]
pub struct PresenceDirectory {
    inner: Arc<RwLock<Inner>>,
}

struct Registration {
    user_id: i64,
    device_id: Option<i64>,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct Inner {
    /// Inverse map for O(1) cleanup on disconnect.
    connections: HashMap<Uuid, Registration>,
    by_user: HashMap<i64, HashSet<Uuid>>,
    by_device: HashMap<i64, HashSet<Uuid>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection. Each connection id is unique,
    /// so two connections of the same user never displace each other.
    pub async fn register(
        &self,
        user_id: i64,
        conn_id: Uuid,
        tx: mpsc::UnboundedSender<ServerEvent>,
        device_id: Option<i64>,
    ) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(conn_id, Registration { user_id, device_id, tx });
        inner.by_user.entry(user_id).or_default().insert(conn_id);
        if let Some(device_id) = device_id {
            inner.by_device.entry(device_id).or_default().insert(conn_id);
        }
    }

    /// Remove a connection. A no-op for connections that disconnected
    /// before completing authentication.
    pub async fn unregister(&self, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        let Some(registration) = inner.connections.remove(&conn_id) else {
            return;
        };
        if let Some(conns) = inner.by_user.get_mut(&registration.user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                inner.by_user.remove(&registration.user_id);
            }
        }
        if let Some(device_id) = registration.device_id {
            if let Some(conns) = inner.by_device.get_mut(&device_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    inner.by_device.remove(&device_id);
                }
            }
        }
    }

    /// Push each payload to every live connection of its target identity.
    /// Matching is disjoint: a device-addressed payload reaches only
    /// connections registered with that device id, a user-addressed payload
    /// only the user's connections registered without one. Offline targets
    /// are silently skipped — durable storage covers delivery on reconnect.
    pub async fn fanout(&self, targets: Vec<(DigestRecipient, ServerEvent)>) {
        let inner = self.inner.read().await;
        for (recipient, event) in targets {
            inner.deliver(recipient, &event);
        }
    }

    /// Push one event to every live connection of a user, with or without
    /// a registered device. Used for conversation-level notifications that
    /// are not digest-addressed.
    pub async fn notify_user(&self, user_id: i64, event: ServerEvent) {
        let inner = self.inner.read().await;
        if let Some(conns) = inner.by_user.get(&user_id) {
            for conn_id in conns {
                if let Some(registration) = inner.connections.get(conn_id) {
                    let _ = registration.tx.send(event.clone());
                }
            }
        }
    }

    /// Number of currently registered connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

impl Inner {
    fn deliver(&self, recipient: DigestRecipient, event: &ServerEvent) {
        match recipient {
            DigestRecipient::User(user_id) => {
                let Some(conns) = self.by_user.get(&user_id) else { return };
                for conn_id in conns {
                    if let Some(registration) = self.connections.get(conn_id) {
                        if registration.device_id.is_none() {
                            // A send failure means the connection is tearing
                            // down; fan-out is best-effort.
                            let _ = registration.tx.send(event.clone());
                        }
                    }
                }
            }
            DigestRecipient::Device(device_id) => {
                let Some(conns) = self.by_device.get(&device_id) else { return };
                for conn_id in conns {
                    if let Some(registration) = self.connections.get(conn_id) {
                        let _ = registration.tx.send(event.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::events::NewMessagePayload;

    fn message_event(digest: &str) -> ServerEvent {
        ServerEvent::NewMessage {
            conversation_id: 1,
            message: NewMessagePayload {
                sender: "alice".into(),
                digest: digest.into(),
                time: 0,
            },
        }
    }

    #[tokio::test]
    async fn two_connections_same_user_both_reachable() {
        let presence = PresenceDirectory::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let conn1 = Uuid::new_v4();
        let conn2 = Uuid::new_v4();

        presence.register(7, conn1, tx1, None).await;
        presence.register(7, conn2, tx2, None).await;

        presence
            .fanout(vec![(DigestRecipient::User(7), message_event("d1"))])
            .await;
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        presence.unregister(conn1).await;
        presence
            .fanout(vec![(DigestRecipient::User(7), message_event("d2"))])
            .await;
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unregister_unknown_connection_is_noop() {
        let presence = PresenceDirectory::new();
        presence.unregister(Uuid::new_v4()).await;
        assert_eq!(presence.connection_count().await, 0);
    }

    #[tokio::test]
    async fn device_connection_reachable_only_via_device_path() {
        let presence = PresenceDirectory::new();
        let (device_tx, mut device_rx) = mpsc::unbounded_channel();
        let (plain_tx, mut plain_rx) = mpsc::unbounded_channel();

        presence.register(7, Uuid::new_v4(), device_tx, Some(42)).await;
        presence.register(7, Uuid::new_v4(), plain_tx, None).await;

        // user-addressed digest skips the device-registered connection
        presence
            .fanout(vec![(DigestRecipient::User(7), message_event("for-user"))])
            .await;
        assert!(device_rx.try_recv().is_err());
        assert!(plain_rx.try_recv().is_ok());

        // device-addressed digest reaches only the device connection
        presence
            .fanout(vec![(DigestRecipient::Device(42), message_event("for-device"))])
            .await;
        assert!(device_rx.try_recv().is_ok());
        assert!(plain_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_user_reaches_every_connection_of_the_user() {
        let presence = PresenceDirectory::new();
        let (device_tx, mut device_rx) = mpsc::unbounded_channel();
        let (plain_tx, mut plain_rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();

        presence.register(7, Uuid::new_v4(), device_tx, Some(42)).await;
        presence.register(7, Uuid::new_v4(), plain_tx, None).await;
        presence.register(8, Uuid::new_v4(), other_tx, None).await;

        presence
            .notify_user(7, ServerEvent::NewConversation { conversation_id: 3, name: "room1".into() })
            .await;
        assert!(device_rx.try_recv().is_ok());
        assert!(plain_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn each_target_receives_only_its_own_digest() {
        let presence = PresenceDirectory::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        presence.register(1, Uuid::new_v4(), a_tx, None).await;
        presence.register(2, Uuid::new_v4(), b_tx, None).await;

        presence
            .fanout(vec![
                (DigestRecipient::User(1), message_event("digest-a")),
                (DigestRecipient::User(2), message_event("digest-b")),
            ])
            .await;

        match a_rx.try_recv().unwrap() {
            ServerEvent::NewMessage { message, .. } => assert_eq!(message.digest, "digest-a"),
            other => panic!("unexpected event: {other:?}"),
        }
        match b_rx.try_recv().unwrap() {
            ServerEvent::NewMessage { message, .. } => assert_eq!(message.digest, "digest-b"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
