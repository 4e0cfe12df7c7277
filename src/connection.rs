//! A live, authenticated client connection.
//!
//! Each connection owns a bounded outbound queue of encoded frames and a
//! call-state slot. Producers never wait on the queue: a full queue means the
//! peer is not keeping up and the caller is expected to drop the connection
//! (see [`crate::hub::Registry::deliver`]).
//!
//! Closing a connection drops the queue sender and cancels its token. The
//! reader stops on the token right away. The writer drains what is queued,
//! but gives up once the token has been cancelled for [`CLOSE_GRACE`] and a
//! write is still pending.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// An encoded text frame waiting in an outbound queue.
pub type Frame = String;

/// How long a closed connection's writer may keep flushing.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Per-user call state used to arbitrate call setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Calling,
    InCall,
}

/// Call state plus the other party of the current call, if any.
#[derive(Debug, Default)]
pub struct CallSlot {
    pub state: CallState,
    pub peer: Option<String>,
}

impl CallSlot {
    pub fn set(&mut self, state: CallState, peer: &str) {
        self.state = state;
        self.peer = Some(peer.to_string());
    }

    pub fn reset(&mut self) {
        self.state = CallState::Idle;
        self.peer = None;
    }
}

pub struct Connection {
    user_id: String,
    /// Distinguishes this instance from a later connection of the same user.
    id: Uuid,
    /// `None` once closed. Dropping the sender ends the writer loop.
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    /// Cancelled by `close()`.
    closed: CancellationToken,
    call: Mutex<CallSlot>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("user_id", &self.user_id)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Create a connection with an outbound queue of `capacity` frames.
    /// Returns the receiving half for the writer loop.
    pub fn new(user_id: &str, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            user_id: user_id.to_string(),
            id: Uuid::new_v4(),
            outbound: Mutex::new(Some(tx)),
            closed: CancellationToken::new(),
            call: Mutex::new(CallSlot::default()),
        };
        (Arc::new(conn), rx)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Push a frame without waiting. Fails if the queue is full or closed.
    pub fn try_enqueue(&self, frame: Frame) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(RelayError::EnqueueFailed(self.user_id.clone()));
        };

        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                Err(RelayError::EnqueueFailed(self.user_id.clone()))
            }
        }
    }

    /// Close the outbound queue and cancel the connection's token. Returns
    /// `false` if it was already closed.
    pub fn close(&self) -> bool {
        let was_open = self.outbound.lock().take().is_some();
        self.closed.cancel();
        was_open
    }

    /// Token cancelled once the connection is closed, by unregister,
    /// replacement or eviction.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    pub fn call_state(&self) -> CallState {
        self.call.lock().state
    }

    /// Lock this connection's call slot.
    ///
    /// Never hold two of these at once except through
    /// [`crate::signaling::lock_pair`], which orders the locks.
    pub fn call(&self) -> MutexGuard<'_, CallSlot> {
        self.call.lock()
    }
}

/// Drain `rx` onto the transport in FIFO order.
///
/// Ends when the queue is closed and empty, on the first write error, or
/// when `closed` has been cancelled for [`CLOSE_GRACE`] and the transport is
/// still not accepting writes. The sink is closed on the way out.
pub async fn run_writer<S>(
    user_id: String,
    mut rx: mpsc::Receiver<Frame>,
    mut sink: S,
    closed: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let give_up = async {
        closed.cancelled().await;
        tokio::time::sleep(CLOSE_GRACE).await;
    };
    tokio::pin!(give_up);

    let mut stalled = false;
    while let Some(frame) = rx.recv().await {
        tokio::select! {
            biased;
            res = sink.send(Message::Text(frame)) => {
                if let Err(e) = res {
                    tracing::debug!(user_id = user_id.as_str(), error = %e, "Write failed, stopping writer");
                    break;
                }
            }
            _ = &mut give_up => {
                stalled = true;
                break;
            }
        }
    }

    if stalled {
        tracing::warn!(user_id = user_id.as_str(), "Transport stalled after close, abandoning writes");
    } else {
        let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
    }
    tracing::debug!(user_id = user_id.as_str(), "Writer stopped");
}
