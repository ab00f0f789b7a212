use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

/// A serialized push frame, shared across every connection it fans out to.
pub type Frame = Arc<str>;

/// One open bidirectional channel of a user (a tab or a device).
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub user_id: Uuid,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ConnectionHandle {
    /// Creates a handle and the receiver the socket task drains.
    pub fn new(user_id: Uuid) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { conn_id: Uuid::new_v4(), user_id, tx }, rx)
    }
}

/// Maps users to their live connections. A user may hold any number.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Tables>>,
}

#[derive(Default)]
struct Tables {
    /// user_id -> conn_id -> handle
    by_user: HashMap<Uuid, HashMap<Uuid, ConnectionHandle>>,
    /// conn_id -> user_id
    by_conn: HashMap<Uuid, Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Returns false when the connection was already registered.
    pub async fn register(&self, handle: ConnectionHandle) -> bool {
        let mut tables = self.inner.write().await;
        if tables.by_conn.contains_key(&handle.conn_id) {
            return false;
        }
        tables.by_conn.insert(handle.conn_id, handle.user_id);
        tables
            .by_user
            .entry(handle.user_id)
            .or_default()
            .insert(handle.conn_id, handle);
        true
    }

    /// Idempotent. Returns false when the connection was not registered.
    pub async fn unregister(&self, conn_id: Uuid) -> bool {
        let mut tables = self.inner.write().await;
        let Some(user_id) = tables.by_conn.remove(&conn_id) else {
            return false;
        };
        if let Some(conns) = tables.by_user.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                tables.by_user.remove(&user_id);
            }
        }
        true
    }

    /// Pushes a frame to every live connection of `user_id` and returns how
    /// many accepted it. Connections whose socket task is gone are pruned.
    pub async fn send_to_user(&self, user_id: Uuid, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let tables = self.inner.read().await;
            let Some(conns) = tables.by_user.get(&user_id) else {
                return 0;
            };
            for (conn_id, handle) in conns {
                if handle.tx.send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*conn_id);
                }
            }
        }

        for conn_id in dead {
            debug!("Pruning closed connection {} of {}", conn_id, user_id);
            self.unregister(conn_id).await;
        }
        delivered
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.read().await.by_user.keys().copied().collect()
    }
}
