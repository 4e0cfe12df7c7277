//! Hub wire protocol.
//!
//! Every frame in both directions is a JSON envelope of the form
//! `{"type": "<kind>", "payload": {...}}`. Chat payloads are persisted;
//! call signaling payloads are transient and only forwarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

// ── Client → Hub ──────────────────────────────────────────────────────────────

/// Frames a client sends to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// A chat line for the other member of a conversation pair.
    Chat(ChatPayload),

    /// SDP offer opening a call.
    CallOffer(CallSdp),

    /// SDP answer accepting a call.
    CallAnswer(CallSdp),

    /// Trickled ICE candidate for an in-progress call.
    IceCandidate(IceCandidate),

    /// Hang up, decline or cancel.
    CallEnd(CallEnd),
}

impl ClientMessage {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(RelayError::Decode)
    }
}

// ── Hub → Client ──────────────────────────────────────────────────────────────

/// Frames the hub pushes onto a connection's outbound queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    Chat(ChatMessage),
    CallOffer(CallSdp),
    CallAnswer(CallSdp),
    IceCandidate(IceCandidate),
    CallEnd(CallEnd),
    /// The hub could not place the sender's call.
    CallError(CallError),
}

impl ServerMessage {
    /// Encode into a text frame ready for the outbound queue.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(RelayError::Encode)
    }
}

// ── Chat ──────────────────────────────────────────────────────────────────────

/// Chat payload as the client sends it. Pair order is arbitrary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub user_id_1: String,
    pub user_id_2: String,
    #[serde(default)]
    pub sender_id: String,
    pub content: String,
}

/// A stored/delivered chat message.
///
/// Always constructed through [`crate::chat::normalize`] on the hub side, so
/// `user_id_1 <= user_id_2` and `created_at` is the hub's clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id_1: String,
    pub user_id_2: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// The participant that is not the sender.
    pub fn recipient(&self) -> &str {
        if self.sender_id == self.user_id_2 {
            &self.user_id_1
        } else {
            &self.user_id_2
        }
    }
}

// ── Call signaling ────────────────────────────────────────────────────────────

/// Media kind of a call (`0` audio, `1` video on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CallType {
    Audio,
    Video,
}

impl TryFrom<u8> for CallType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Audio),
            1 => Ok(Self::Video),
            other => Err(format!("unknown call_type {}", other)),
        }
    }
}

impl From<CallType> for u8 {
    fn from(value: CallType) -> Self {
        match value {
            CallType::Audio => 0,
            CallType::Video => 1,
        }
    }
}

/// Which half of the SDP exchange a [`CallSdp`] carries (`0` offer, `1` answer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SdpType {
    Offer,
    Answer,
}

impl TryFrom<u8> for SdpType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Offer),
            1 => Ok(Self::Answer),
            other => Err(format!("unknown sdp_type {}", other)),
        }
    }
}

impl From<SdpType> for u8 {
    fn from(value: SdpType) -> Self {
        match value {
            SdpType::Offer => 0,
            SdpType::Answer => 1,
        }
    }
}

/// SDP offer or answer between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSdp {
    pub call_type: CallType,
    pub sdp_type: SdpType,
    #[serde(default)]
    pub sender_id: String,
    pub receiver_id: String,
    pub sdp_string: String,
    pub time: DateTime<Utc>,
}

/// A single ICE candidate.
///
/// `sdpMid` and `sdpIndex` are optional. Absent is distinct from empty, and
/// absent fields are left out of the encoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(default)]
    pub sender_id: String,
    pub receiver_id: String,
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnd {
    #[serde(default)]
    pub sender_id: String,
    pub receiver_id: String,
}

/// Why an offer was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorReason {
    UserOffline,
    UserBusy,
    DeliveryFailed,
}

/// Payload of a `call-error` frame, addressed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub reason: CallErrorReason,
    pub receiver_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_chat_frame() {
        let text = r#"{"type":"chat","payload":{"user_id_1":"bob","user_id_2":"alice","sender_id":"bob","content":"hi"}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::Chat(chat) => {
                assert_eq!(chat.user_id_1, "bob");
                assert_eq!(chat.content, "hi");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_call_offer_frame() {
        let text = r#"{"type":"call-offer","payload":{"call_type":1,"sdp_type":0,"sender_id":"alice","receiver_id":"bob","sdp_string":"v=0","time":"2024-05-01T10:00:00Z"}}"#;
        match ClientMessage::decode(text).unwrap() {
            ClientMessage::CallOffer(offer) => {
                assert_eq!(offer.call_type, CallType::Video);
                assert_eq!(offer.sdp_type, SdpType::Offer);
                assert_eq!(offer.receiver_id, "bob");
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = ClientMessage::decode(r#"{"type":"dance","payload":{}}"#).unwrap_err();
        assert!(matches!(err, RelayError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_bad_call_type() {
        let text = r#"{"type":"call-offer","payload":{"call_type":7,"sdp_type":0,"receiver_id":"bob","sdp_string":"v=0","time":"2024-05-01T10:00:00Z"}}"#;
        assert!(ClientMessage::decode(text).is_err());
    }

    #[test]
    fn test_ice_candidate_optional_fields() {
        let absent = r#"{"type":"ice-candidate","payload":{"sender_id":"a","receiver_id":"b","candidate":"candidate:1"}}"#;
        let empty = r#"{"type":"ice-candidate","payload":{"sender_id":"a","receiver_id":"b","candidate":"candidate:1","sdpMid":"","sdpIndex":0}}"#;

        let ClientMessage::IceCandidate(absent) = ClientMessage::decode(absent).unwrap() else {
            panic!("Wrong variant");
        };
        let ClientMessage::IceCandidate(empty) = ClientMessage::decode(empty).unwrap() else {
            panic!("Wrong variant");
        };

        assert_eq!(absent.sdp_mid, None);
        assert_eq!(absent.sdp_index, None);
        assert_eq!(empty.sdp_mid.as_deref(), Some(""));
        assert_eq!(empty.sdp_index, Some(0));

        let json = ServerMessage::IceCandidate(absent).encode().unwrap();
        assert!(!json.contains("sdpMid"));
        assert!(!json.contains("sdpIndex"));
    }

    #[test]
    fn test_call_error_frame_shape() {
        let msg = ServerMessage::CallError(CallError {
            reason: CallErrorReason::UserBusy,
            receiver_id: "bob".to_string(),
        });
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "call-error");
        assert_eq!(value["payload"]["reason"], "user_busy");
        assert_eq!(value["payload"]["receiver_id"], "bob");
    }

    #[test]
    fn test_chat_recipient() {
        let msg = ChatMessage {
            user_id_1: "alice".to_string(),
            user_id_2: "bob".to_string(),
            sender_id: "bob".to_string(),
            content: "yo".to_string(),
            created_at: Utc::now(),
        };
        assert_eq!(msg.recipient(), "alice");
    }
}
