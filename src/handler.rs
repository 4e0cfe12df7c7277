//! WebSocket connection handler.
//!
//! Runs one authenticated connection: registers it with the hub, spawns its
//! writer, and routes decoded frames until the client goes away.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;

use crate::chat::normalize;
use crate::connection::{run_writer, Connection};
use crate::error::{RelayError, Result};
use crate::protocol::{CallSdp, ClientMessage, SdpType};
use crate::state::RelayState;

/// Handle a single WebSocket connection for `user_id`.
///
/// The identity was verified during the HTTP upgrade; there is no in-band
/// registration step.
pub async fn handle_websocket(socket: WebSocket, state: RelayState, user_id: String) {
    let (ws_sender, mut ws_receiver) = socket.split();

    // ── Step 1: Register ──────────────────────────────────────────────────

    let (conn, rx) = Connection::new(&user_id, state.config.queue_capacity);
    if let Err(e) = state.hub.register(conn.clone()).await {
        tracing::error!(user_id = user_id.as_str(), error = %e, "Hub unavailable, dropping connection");
        return;
    }

    // ── Step 2: Spawn Writer ──────────────────────────────────────────────

    // Ends on its own once the connection is closed, by unregister or eviction.
    let closed = conn.closed_token();
    tokio::spawn(run_writer(user_id.clone(), rx, ws_sender, closed.clone()));

    // ── Step 3: Process Messages ──────────────────────────────────────────

    loop {
        let msg_result = tokio::select! {
            _ = closed.cancelled() => {
                tracing::info!(user_id = user_id.as_str(), "Connection closed by hub");
                break;
            }
            next = ws_receiver.next() => match next {
                Some(msg_result) => msg_result,
                None => break,
            },
        };

        match msg_result {
            Ok(Message::Text(text)) => {
                let msg = match ClientMessage::decode(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!(
                            user_id = user_id.as_str(),
                            error = %e,
                            "Failed to parse client message, closing"
                        );
                        break;
                    }
                };

                if let Err(e) = route_client_message(&state, &conn, msg).await {
                    log_route_error(&user_id, &e);
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!(user_id = user_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(user_id = user_id.as_str(), error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Ping, Pong
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    state.hub.unregister(conn.clone()).await;
    state.router.hang_up(&conn);
    tracing::info!(user_id = user_id.as_str(), "WebSocket disconnected");
}

/// Dispatch one decoded frame from `conn`.
///
/// Every `sender_id` is replaced by the connection's own identity before
/// anything is forwarded.
pub async fn route_client_message(
    state: &RelayState,
    conn: &Arc<Connection>,
    msg: ClientMessage,
) -> Result<()> {
    let sender = conn.user_id();

    match msg {
        ClientMessage::Chat(payload) => {
            let message = normalize(payload, sender)?;
            state.hub.dispatch_chat(message).await
        }

        ClientMessage::CallOffer(offer) => {
            let offer = authenticated_sdp(offer, sender, SdpType::Offer)?;
            state.router.send_offer(conn, offer)
        }

        ClientMessage::CallAnswer(answer) => {
            let answer = authenticated_sdp(answer, sender, SdpType::Answer)?;
            state.router.send_answer(conn, answer)
        }

        ClientMessage::IceCandidate(mut candidate) => {
            candidate.sender_id = sender.to_string();
            state.router.send_ice_candidate(conn, candidate)
        }

        ClientMessage::CallEnd(mut end) => {
            end.sender_id = sender.to_string();
            state.router.end_call(conn, end);
            Ok(())
        }
    }
}

fn authenticated_sdp(mut sdp: CallSdp, sender: &str, expected: SdpType) -> Result<CallSdp> {
    if sdp.sdp_type != expected {
        return Err(RelayError::InvalidMessage(format!(
            "sdp_type {:?} does not match frame type",
            sdp.sdp_type
        )));
    }
    sdp.sender_id = sender.to_string();
    Ok(sdp)
}

/// Routing failures never end the connection. Expected outcomes of call
/// setup are quiet; anything else is worth a warning.
fn log_route_error(user_id: &str, e: &RelayError) {
    match e {
        RelayError::ReceiverOffline(_) | RelayError::ReceiverBusy(_) => {
            tracing::debug!(user_id, error = %e, "Signaling not delivered");
        }
        RelayError::EnqueueFailed(_) => {
            tracing::debug!(user_id, error = %e, "Peer dropped during delivery");
        }
        _ => {
            tracing::warn!(user_id, error = %e, "Rejected client message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DevTokenVerifier;
    use crate::connection::{CallState, Frame};
    use crate::protocol::ServerMessage;
    use crate::state::RelayConfig;
    use crate::store::SqliteMessageStore;
    use tokio::sync::mpsc;

    async fn state() -> RelayState {
        let store = Arc::new(SqliteMessageStore::open_in_memory().unwrap());
        RelayState::start(RelayConfig::default(), store, Arc::new(DevTokenVerifier))
    }

    async fn join(state: &RelayState, user_id: &str) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        let (conn, rx) = Connection::new(user_id, 16);
        state.hub.register(conn.clone()).await.unwrap();
        (conn, rx)
    }

    fn decode(text: &str) -> ClientMessage {
        ClientMessage::decode(text).unwrap()
    }

    #[tokio::test]
    async fn test_chat_uses_authenticated_sender() {
        let state = state().await;
        let (alice, _alice_rx) = join(&state, "alice").await;
        let (_bob, mut bob_rx) = join(&state, "bob").await;

        let frame = r#"{"type":"chat","payload":{"user_id_1":"bob","user_id_2":"alice","sender_id":"mallory","content":"hi"}}"#;
        route_client_message(&state, &alice, decode(frame)).await.unwrap();

        let received: ServerMessage = serde_json::from_str(&bob_rx.recv().await.unwrap()).unwrap();
        match received {
            ServerMessage::Chat(msg) => {
                assert_eq!(msg.sender_id, "alice");
                assert_eq!(msg.user_id_1, "alice");
                assert_eq!(msg.user_id_2, "bob");
            }
            other => panic!("expected chat, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_from_outsider_is_rejected() {
        let state = state().await;
        let (carol, _rx) = join(&state, "carol").await;

        let frame = r#"{"type":"chat","payload":{"user_id_1":"alice","user_id_2":"bob","content":"hi"}}"#;
        let err = route_client_message(&state, &carol, decode(frame)).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(_)));
        assert!(state.registry.is_online("carol"));
    }

    #[tokio::test]
    async fn test_offer_sender_is_overwritten() {
        let state = state().await;
        let (alice, _alice_rx) = join(&state, "alice").await;
        let (bob, mut bob_rx) = join(&state, "bob").await;

        let frame = r#"{"type":"call-offer","payload":{"call_type":1,"sdp_type":0,"sender_id":"mallory","receiver_id":"bob","sdp_string":"v=0","time":"2024-05-01T10:00:00Z"}}"#;
        route_client_message(&state, &alice, decode(frame)).await.unwrap();

        let value: serde_json::Value = serde_json::from_str(&bob_rx.recv().await.unwrap()).unwrap();
        assert_eq!(value["type"], "call-offer");
        assert_eq!(value["payload"]["sender_id"], "alice");
        assert_eq!(value["payload"]["call_type"], 1);
        assert_eq!(bob.call_state(), CallState::Calling);
    }

    #[tokio::test]
    async fn test_offer_with_answer_sdp_type_is_rejected() {
        let state = state().await;
        let (alice, _alice_rx) = join(&state, "alice").await;
        let (bob, _bob_rx) = join(&state, "bob").await;

        let frame = r#"{"type":"call-offer","payload":{"call_type":0,"sdp_type":1,"receiver_id":"bob","sdp_string":"v=0","time":"2024-05-01T10:00:00Z"}}"#;
        let err = route_client_message(&state, &alice, decode(frame)).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidMessage(_)));
        assert_eq!(alice.call_state(), CallState::Idle);
        assert_eq!(bob.call_state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_call_end_is_never_an_error() {
        let state = state().await;
        let (alice, _rx) = join(&state, "alice").await;
        alice.call().set(CallState::InCall, "ghost");

        let frame = r#"{"type":"call-end","payload":{"sender_id":"alice","receiver_id":"ghost"}}"#;
        route_client_message(&state, &alice, decode(frame)).await.unwrap();
        assert_eq!(alice.call_state(), CallState::Idle);
    }
}
