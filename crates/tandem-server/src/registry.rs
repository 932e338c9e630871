//! Session registry: the live connection of each user.
//!
//! At most one connection per user. Registering a new connection drops the
//! previous handle, which closes that connection's outbound queue and ends
//! its socket task.

use std::sync::Arc;

use dashmap::DashMap;
use tandem_shared::{ServerEvent, UserId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};
use uuid::Uuid;

/// Sending half of one connection's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
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

    /// Queue an event without waiting. `false` if the queue is full or closed.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(conn = %self.id, "outbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<UserId, ConnectionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `user`, superseding any previous connection.
    pub fn register(&self, user: UserId, handle: ConnectionHandle) {
        let conn = handle.id();
        if let Some(previous) = self.sessions.insert(user, handle) {
            info!(
                user = %user.short(),
                old = %previous.id(),
                new = %conn,
                "connection superseded"
            );
        } else {
            info!(user = %user.short(), %conn, "connection registered");
        }
    }

    pub fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.sessions.get(user).map(|entry| entry.value().clone())
    }

    /// Remove the user's connection, whichever it is. Idempotent.
    pub fn unregister(&self, user: &UserId) -> bool {
        self.sessions.remove(user).is_some()
    }

    /// Remove the user's connection only if it is still `conn`, so a closing
    /// socket never evicts the connection that replaced it.
    pub fn unregister_connection(&self, user: &UserId, conn: Uuid) -> bool {
        let removed = self
            .sessions
            .remove_if(user, |_, handle| handle.id() == conn)
            .is_some();
        if removed {
            info!(user = %user.short(), %conn, "connection unregistered");
        }
        removed
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.sessions.contains_key(user)
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }
}
