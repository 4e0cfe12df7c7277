//! Connection registry and hub coordination loop.
//!
//! [`Registry`] is the single source of truth for who is online. Register,
//! unregister and chat dispatch go through the [`Hub`] loop. The one write
//! outside the loop is eviction in [`Registry::deliver`], which runs on
//! whichever task hit the full queue; it takes the same write lock and only
//! removes the exact instance it failed to reach. The signaling router reads
//! the map directly under the shared lock so lookups never wait on loop
//! throughput.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::chat::ChatPersister;
use crate::connection::Connection;
use crate::error::{RelayError, Result};
use crate::protocol::{ChatMessage, ServerMessage};

// ── Registry ──────────────────────────────────────────────────────────────────

/// User ID → live connection. At most one connection per user.
#[derive(Clone, Default)]
pub struct Registry {
    clients: Arc<RwLock<HashMap<String, Arc<Connection>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. An existing connection for the same user is
    /// closed and returned; the last registration wins.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let user_id = conn.user_id().to_string();
        let previous = self.clients.write().insert(user_id.clone(), conn);

        if let Some(ref old) = previous {
            old.close();
            tracing::info!(
                user_id = user_id.as_str(),
                replaced = %old.id(),
                "Client re-registered, closed previous connection"
            );
        } else {
            tracing::info!(user_id = user_id.as_str(), "Client registered");
        }

        previous
    }

    /// Remove a connection and close its queue.
    ///
    /// The map entry is only removed if it still points at this instance, so
    /// a late unregister cannot evict a newer connection of the same user.
    /// Returns whether the entry was removed.
    pub fn unregister(&self, conn: &Arc<Connection>) -> bool {
        let removed = {
            let mut clients = self.clients.write();
            let current = clients
                .get(conn.user_id())
                .is_some_and(|c| Arc::ptr_eq(c, conn));
            if current {
                clients.remove(conn.user_id());
            }
            current
        };
        conn.close();

        if removed {
            tracing::info!(user_id = conn.user_id(), "Client unregistered");
        }
        removed
    }

    pub fn lookup(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.clients.read().get(user_id).cloned()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.clients.read().contains_key(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Encode and enqueue `message` for `conn`.
    ///
    /// A connection whose queue rejects the frame is treated as dead: it is
    /// removed from the registry and its queue closed before the error is
    /// returned.
    pub fn deliver(&self, conn: &Arc<Connection>, message: &ServerMessage) -> Result<()> {
        let frame = message.encode()?;

        if let Err(e) = conn.try_enqueue(frame) {
            tracing::warn!(
                user_id = conn.user_id(),
                "Outbound queue full or closed, dropping connection"
            );
            self.unregister(conn);
            return Err(e);
        }
        Ok(())
    }
}

// ── Hub ───────────────────────────────────────────────────────────────────────

struct Registration {
    conn: Arc<Connection>,
    done: oneshot::Sender<()>,
}

/// Producer side of the hub loop. Cheap to clone.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
    chat_tx: mpsc::Sender<ChatMessage>,
}

impl HubHandle {
    /// Register a connection and wait until the hub has applied it, so the
    /// caller is reachable as soon as this returns.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<()> {
        let user_id = conn.user_id().to_string();
        let (done, applied) = oneshot::channel();

        self.register_tx
            .send(Registration { conn, done })
            .await
            .map_err(|_| RelayError::EnqueueFailed(user_id.clone()))?;
        applied
            .await
            .map_err(|_| RelayError::EnqueueFailed(user_id))
    }

    pub async fn unregister(&self, conn: Arc<Connection>) {
        if self.unregister_tx.send(conn).await.is_err() {
            tracing::warn!("Hub stopped, unregister dropped");
        }
    }

    pub async fn dispatch_chat(&self, message: ChatMessage) -> Result<()> {
        let sender = message.sender_id.clone();
        self.chat_tx
            .send(message)
            .await
            .map_err(|_| RelayError::EnqueueFailed(sender))
    }
}

/// The single-writer coordination loop.
pub struct Hub {
    registry: Registry,
    persister: ChatPersister,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Arc<Connection>>,
    chat_rx: mpsc::Receiver<ChatMessage>,
}

impl Hub {
    /// Create the hub and its handle. Each input channel holds up to
    /// `capacity` pending events.
    pub fn new(registry: Registry, persister: ChatPersister, capacity: usize) -> (Self, HubHandle) {
        let capacity = capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (chat_tx, chat_rx) = mpsc::channel(capacity);

        let hub = Self {
            registry,
            persister,
            register_rx,
            unregister_rx,
            chat_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            chat_tx,
        };
        (hub, handle)
    }

    /// Run until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        tracing::debug!("Hub loop started");
        loop {
            tokio::select! {
                Some(Registration { conn, done }) = self.register_rx.recv() => {
                    self.registry.register(conn);
                    let _ = done.send(());
                }
                Some(conn) = self.unregister_rx.recv() => {
                    self.registry.unregister(&conn);
                }
                Some(message) = self.chat_rx.recv() => {
                    self.dispatch_chat(message);
                }
                else => break,
            }
        }
        tracing::debug!("Hub loop stopped");
    }

    /// Hand the message to persistence, then deliver it to the recipient if
    /// they are online. Offline recipients catch up through history sync.
    fn dispatch_chat(&self, message: ChatMessage) {
        self.persister.submit(message.clone());

        let recipient_id = message.recipient().to_string();
        match self.registry.lookup(&recipient_id) {
            Some(recipient) => {
                if self
                    .registry
                    .deliver(&recipient, &ServerMessage::Chat(message))
                    .is_ok()
                {
                    tracing::debug!(to = recipient_id.as_str(), "Delivered chat message");
                }
            }
            None => {
                tracing::debug!(to = recipient_id.as_str(), "Chat recipient offline, stored only");
            }
        }
    }
}
