//! Chat relay: message normalization and background persistence.
//!
//! Persistence never blocks the hub. Messages are submitted to a bounded
//! work queue consumed by a fixed set of worker tasks. On shutdown the queue
//! is closed and the workers drain it within a deadline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::{RelayError, Result};
use crate::protocol::{ChatMessage, ChatPayload};
use crate::store::MessageStore;

/// Order a conversation pair so the smaller user ID comes first.
pub fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Build the stored form of a client chat payload.
///
/// `sender` is the authenticated identity of the connection the payload
/// arrived on; whatever the client put in `sender_id` is ignored. The pair is
/// ordered and the timestamp taken from the hub clock.
pub fn normalize(payload: ChatPayload, sender: &str) -> Result<ChatMessage> {
    if payload.user_id_1.is_empty() || payload.user_id_2.is_empty() {
        return Err(RelayError::InvalidMessage("empty participant id".to_string()));
    }
    if payload.user_id_1 == payload.user_id_2 {
        return Err(RelayError::InvalidMessage(
            "conversation needs two distinct participants".to_string(),
        ));
    }
    if sender != payload.user_id_1 && sender != payload.user_id_2 {
        return Err(RelayError::InvalidMessage(format!(
            "sender {} is not a participant",
            sender
        )));
    }

    let (user_id_1, user_id_2) = ordered_pair(&payload.user_id_1, &payload.user_id_2);
    Ok(ChatMessage {
        user_id_1,
        user_id_2,
        sender_id: sender.to_string(),
        content: payload.content,
        created_at: Utc::now(),
    })
}

// ── Persistence queue ─────────────────────────────────────────────────────────

struct PersisterInner {
    tx: Mutex<Option<mpsc::Sender<ChatMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: AtomicUsize,
}

/// Handle to the chat persistence workers. Cheap to clone.
#[derive(Clone)]
pub struct ChatPersister {
    inner: Arc<PersisterInner>,
}

impl ChatPersister {
    /// Spawn `workers` tasks writing to `store`, fed by a queue of `capacity`.
    pub fn start(store: Arc<dyn MessageStore>, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<ChatMessage>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let inner = Arc::new(PersisterInner {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::new()),
            queued: AtomicUsize::new(0),
        });

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let store = store.clone();
                let inner = inner.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(message) = next else { break };
                        inner.queued.fetch_sub(1, Ordering::Relaxed);

                        if let Err(e) = store.persist(&message).await {
                            tracing::error!(
                                worker,
                                sender = message.sender_id.as_str(),
                                error = %e,
                                "Failed to store chat message"
                            );
                        }
                    }
                    tracing::debug!(worker, "Persistence worker stopped");
                })
            })
            .collect();

        *inner.workers.lock() = handles;
        Self { inner }
    }

    /// Queue a message for storage without waiting.
    ///
    /// Returns `false` if the queue is full or shut down; the message is then
    /// not stored and the failure is logged.
    pub fn submit(&self, message: ChatMessage) -> bool {
        let tx = self.inner.tx.lock();
        let Some(tx) = tx.as_ref() else {
            tracing::warn!("Persistence shut down, chat message not stored");
            return false;
        };

        self.inner.queued.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) | Err(TrySendError::Closed(message)) => {
                self.inner.queued.fetch_sub(1, Ordering::Relaxed);
                tracing::error!(
                    sender = message.sender_id.as_str(),
                    "Persistence queue full, chat message not stored"
                );
                false
            }
        }
    }

    /// Messages accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Relaxed)
    }

    /// Stop accepting messages and wait up to `deadline` for the workers to
    /// drain the queue. Workers still running after that are aborted.
    /// Returns `true` if everything drained in time.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.inner.tx.lock().take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(deadline, futures::future::join_all(handles)).await {
            Ok(_) => {
                tracing::info!("Chat persistence drained");
                true
            }
            Err(_) => {
                tracing::warn!(
                    pending = self.queued(),
                    "Chat persistence did not drain in time, aborting workers"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}
