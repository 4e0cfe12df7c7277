//! Chat message storage.
//!
//! The hub only needs two things from a store: append a message, and read a
//! conversation back for history sync. Two backends are provided:
//!
//! - [`SqliteMessageStore`]: local SQLite file (or in-memory for tests)
//! - [`RestMessageStore`]: a PostgREST-style `messages` table (Supabase)

pub mod rest;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::chat::ordered_pair;
use crate::error::Result;
use crate::protocol::ChatMessage;

pub use rest::RestMessageStore;
pub use sqlite::SqliteMessageStore;

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

/// Upper bound on a single history page.
pub const MAX_HISTORY_LIMIT: u32 = 1000;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a normalized message.
    async fn persist(&self, message: &ChatMessage) -> Result<()>;

    /// Read one conversation, oldest first.
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<ChatMessage>>;
}

/// A page of one conversation.
///
/// With `since` set, only messages created strictly after it are returned
/// and `offset` is ignored (incremental sync). Otherwise `limit`/`offset`
/// paginate the full conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub user_id_1: String,
    pub user_id_2: String,
    pub since: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl HistoryQuery {
    /// Query the conversation between `a` and `b`, in either order.
    pub fn between(a: &str, b: &str) -> Self {
        let (user_id_1, user_id_2) = ordered_pair(a, b);
        Self {
            user_id_1,
            user_id_2,
            since: None,
            limit: DEFAULT_HISTORY_LIMIT,
            offset: 0,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}
