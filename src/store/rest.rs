//! Message store backed by a PostgREST `messages` table (Supabase REST API).

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::StatusCode;
use serde_json::json;

use super::{HistoryQuery, MessageStore};
use crate::error::{RelayError, Result};
use crate::protocol::ChatMessage;

#[derive(Clone)]
pub struct RestMessageStore {
    client: reqwest::Client,
    /// `{project_url}/rest/v1/messages`
    table_url: String,
    api_key: String,
}

impl RestMessageStore {
    pub fn new(project_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            table_url: format!("{}/rest/v1/messages", project_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        }
    }

    /// Query string for one history page, PostgREST filter syntax.
    fn history_url(&self, query: &HistoryQuery) -> String {
        let pair = format!(
            "user_id_1=eq.{}&user_id_2=eq.{}",
            urlencoding::encode(&query.user_id_1),
            urlencoding::encode(&query.user_id_2)
        );

        match query.since {
            Some(since) => format!(
                "{}?{}&created_at=gt.{}&order=created_at.asc&limit={}",
                self.table_url,
                pair,
                urlencoding::encode(&since.to_rfc3339_opts(SecondsFormat::Micros, true)),
                query.limit
            ),
            None => format!(
                "{}?{}&order=created_at.asc&limit={}&offset={}",
                self.table_url, pair, query.limit, query.offset
            ),
        }
    }
}

#[async_trait]
impl MessageStore for RestMessageStore {
    async fn persist(&self, message: &ChatMessage) -> Result<()> {
        let body = json!([{
            "user_id_1": message.user_id_1,
            "user_id_2": message.user_id_2,
            "sender_id": message.sender_id,
            "content": message.content,
            "created_at": message.created_at.to_rfc3339(),
        }]);

        let resp = self
            .client
            .post(&self.table_url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::CREATED && status != StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = text.as_str(), "Message insert rejected");
            return Err(RelayError::Store(format!("failed to insert message: {}", status)));
        }
        Ok(())
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<ChatMessage>> {
        let resp = self
            .client
            .get(self.history_url(query))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Store(format!("failed to fetch messages: {}", status)));
        }

        resp.json::<Vec<ChatMessage>>()
            .await
            .map_err(|e| RelayError::Store(format!("failed to parse messages: {}", e)))
    }
}
