//! Athena Relay
//!
//! A WebSocket presence hub for one-to-one chat and WebRTC call signaling:
//!
//! 1. **Presence**: one live connection per authenticated user, tracked in a
//!    registry that both chat delivery and signaling route through.
//!
//! 2. **Chat relay**: messages are normalized, handed to a bounded
//!    persistence queue and delivered live when the recipient is online.
//!    Offline recipients catch up through the history endpoint.
//!
//! 3. **Call signaling**: offers, answers, ICE candidates and hang-ups are
//!    forwarded between peers under a per-user Idle/Calling/InCall state
//!    machine that rejects calls to busy users.
//!
//! Slow consumers are disconnected rather than buffered: every connection
//! has a fixed-size outbound queue, and a full queue drops the connection.

pub mod api;
pub mod auth;
pub mod chat;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod protocol;
pub mod signaling;
pub mod state;
pub mod store;

pub use error::{RelayError, Result};
pub use state::{RelayConfig, RelayState};
