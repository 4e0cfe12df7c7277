//! One-to-one call signaling.
//!
//! Every operation has the same shape: resolve the receiver in the registry,
//! check preconditions, move call state, encode and enqueue, and roll the
//! state back if delivery fails after the state moved.
//!
//! ```text
//!   Idle ──offer──► Calling ──answer──► InCall
//!    ▲                 │                  │
//!    └──── end / busy / offline / failed delivery
//! ```
//!
//! When both parties' call slots are needed they are locked in a fixed order
//! (by user ID, then connection ID), so two users calling each other at the
//! same moment cannot deadlock; exactly one of the offers wins.

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::connection::{CallSlot, CallState, Connection};
use crate::error::{RelayError, Result};
use crate::hub::Registry;
use crate::protocol::{CallEnd, CallError, CallErrorReason, CallSdp, IceCandidate, ServerMessage};

/// Lock two distinct connections' call slots in a total order.
/// The guards are returned in argument order.
pub fn lock_pair<'a>(
    a: &'a Connection,
    b: &'a Connection,
) -> (MutexGuard<'a, CallSlot>, MutexGuard<'a, CallSlot>) {
    debug_assert!(a.id() != b.id(), "lock_pair needs two distinct connections");

    if (a.user_id(), a.id()) <= (b.user_id(), b.id()) {
        let first = a.call();
        let second = b.call();
        (first, second)
    } else {
        let second = b.call();
        let first = a.call();
        (first, second)
    }
}

#[derive(Clone)]
pub struct SignalingRouter {
    registry: Registry,
}

impl SignalingRouter {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Tell the caller their call could not be placed. The caller's own
    /// connection stays open.
    fn reject(&self, sender: &Arc<Connection>, reason: CallErrorReason, receiver_id: &str) {
        let msg = ServerMessage::CallError(CallError {
            reason,
            receiver_id: receiver_id.to_string(),
        });
        if let Err(e) = self.registry.deliver(sender, &msg) {
            tracing::warn!(user_id = sender.user_id(), error = %e, "Failed to send call-error");
        }
    }

    fn rollback(sender: &Connection, receiver: &Connection) {
        let (mut s, mut r) = lock_pair(sender, receiver);
        s.reset();
        r.reset();
    }

    /// Forward an SDP offer. The receiver must be online and idle.
    pub fn send_offer(&self, sender: &Arc<Connection>, offer: CallSdp) -> Result<()> {
        let receiver_id = offer.receiver_id.clone();

        let receiver = match self.registry.lookup(&receiver_id) {
            Some(receiver) => receiver,
            None => {
                tracing::info!(
                    from = sender.user_id(),
                    to = receiver_id.as_str(),
                    "Offer to offline user"
                );
                self.reject(sender, CallErrorReason::UserOffline, &receiver_id);
                return Err(RelayError::ReceiverOffline(receiver_id));
            }
        };

        // Calling yourself, possibly from a stale connection: always busy.
        if receiver.user_id() == sender.user_id() {
            self.reject(sender, CallErrorReason::UserBusy, &receiver_id);
            return Err(RelayError::ReceiverBusy(receiver_id));
        }

        {
            let (mut s, mut r) = lock_pair(sender, &receiver);
            if r.state != CallState::Idle {
                drop((s, r));
                tracing::info!(
                    from = sender.user_id(),
                    to = receiver_id.as_str(),
                    "Offer to busy user"
                );
                self.reject(sender, CallErrorReason::UserBusy, &receiver_id);
                return Err(RelayError::ReceiverBusy(receiver_id));
            }
            s.set(CallState::Calling, receiver.user_id());
            r.set(CallState::Calling, sender.user_id());
        }

        if let Err(e) = self.registry.deliver(&receiver, &ServerMessage::CallOffer(offer)) {
            tracing::warn!(
                from = sender.user_id(),
                to = receiver_id.as_str(),
                error = %e,
                "Offer delivery failed, rolling back"
            );
            Self::rollback(sender, &receiver);
            self.reject(sender, CallErrorReason::DeliveryFailed, &receiver_id);
            return Err(e);
        }

        tracing::info!(from = sender.user_id(), to = receiver_id.as_str(), "Forwarded offer");
        Ok(())
    }

    /// Forward an SDP answer and put both parties in the call.
    ///
    /// No `call-error` goes back to the answerer on failure; their state is
    /// reset and the error returned to the caller for logging.
    pub fn send_answer(&self, sender: &Arc<Connection>, answer: CallSdp) -> Result<()> {
        let receiver_id = answer.receiver_id.clone();

        let receiver = match self.registry.lookup(&receiver_id) {
            Some(receiver) if receiver.user_id() != sender.user_id() => receiver,
            _ => {
                tracing::warn!(
                    from = sender.user_id(),
                    to = receiver_id.as_str(),
                    "Answer to offline user"
                );
                sender.call().reset();
                return Err(RelayError::ReceiverOffline(receiver_id));
            }
        };

        {
            let (mut s, mut r) = lock_pair(sender, &receiver);
            s.set(CallState::InCall, receiver.user_id());
            r.set(CallState::InCall, sender.user_id());
        }

        if let Err(e) = self.registry.deliver(&receiver, &ServerMessage::CallAnswer(answer)) {
            tracing::warn!(
                from = sender.user_id(),
                to = receiver_id.as_str(),
                error = %e,
                "Answer delivery failed, rolling back"
            );
            Self::rollback(sender, &receiver);
            return Err(e);
        }

        tracing::info!(from = sender.user_id(), to = receiver_id.as_str(), "Forwarded answer");
        Ok(())
    }

    /// Forward an ICE candidate regardless of call state.
    pub fn send_ice_candidate(&self, sender: &Arc<Connection>, candidate: IceCandidate) -> Result<()> {
        let receiver_id = candidate.receiver_id.clone();

        let Some(receiver) = self.registry.lookup(&receiver_id) else {
            tracing::debug!(
                from = sender.user_id(),
                to = receiver_id.as_str(),
                "ICE candidate for offline user dropped"
            );
            return Err(RelayError::ReceiverOffline(receiver_id));
        };

        self.registry
            .deliver(&receiver, &ServerMessage::IceCandidate(candidate))
            .inspect_err(|e| {
                tracing::warn!(to = receiver_id.as_str(), error = %e, "ICE candidate not delivered");
            })
    }

    /// Hang up. The sender always returns to idle; an online receiver is
    /// reset too and told about it. Never fails.
    pub fn end_call(&self, sender: &Arc<Connection>, end: CallEnd) {
        sender.call().reset();

        let receiver_id = end.receiver_id.clone();
        match self.registry.lookup(&receiver_id) {
            Some(receiver) => {
                if !Arc::ptr_eq(&receiver, sender) {
                    receiver.call().reset();
                }
                if let Err(e) = self.registry.deliver(&receiver, &ServerMessage::CallEnd(end)) {
                    tracing::debug!(to = receiver_id.as_str(), error = %e, "call-end not delivered");
                }
            }
            None => {
                tracing::debug!(to = receiver_id.as_str(), "call-end for offline user");
            }
        }

        tracing::info!(from = sender.user_id(), to = receiver_id.as_str(), "Call ended");
    }

    /// End whatever call `conn` was part of when it goes away.
    ///
    /// The peer is only reset if its slot still points back at this user.
    pub fn hang_up(&self, conn: &Arc<Connection>) {
        let peer_id = {
            let mut slot = conn.call();
            if slot.state == CallState::Idle {
                return;
            }
            let peer = slot.peer.take();
            slot.reset();
            peer
        };

        let Some(peer_id) = peer_id else { return };
        let Some(peer) = self.registry.lookup(&peer_id) else { return };
        if Arc::ptr_eq(&peer, conn) {
            return;
        }

        let was_peer = {
            let mut slot = peer.call();
            if slot.peer.as_deref() == Some(conn.user_id()) {
                slot.reset();
                true
            } else {
                false
            }
        };

        if was_peer {
            let end = ServerMessage::CallEnd(CallEnd {
                sender_id: conn.user_id().to_string(),
                receiver_id: peer_id.clone(),
            });
            if self.registry.deliver(&peer, &end).is_ok() {
                tracing::info!(
                    user_id = conn.user_id(),
                    peer = peer_id.as_str(),
                    "Disconnected mid-call, notified peer"
                );
            }
        }
    }
}
