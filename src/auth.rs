//! Identity verification.
//!
//! The relay never issues tokens; it only asks an identity provider which
//! user a bearer token belongs to.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{RelayError, Result};

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a token to the user ID it was issued for.
    async fn verify(&self, token: &str) -> Result<String>;
}

/// Strip an optional `Bearer ` prefix from an `Authorization` header value.
pub fn bearer_token(header: &str) -> &str {
    header.strip_prefix("Bearer ").unwrap_or(header).trim()
}

// ── GoTrue (Supabase Auth) ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
}

/// Verifies tokens with `GET {auth_url}/user`.
#[derive(Clone)]
pub struct GoTrueVerifier {
    client: reqwest::Client,
    auth_url: String,
    api_key: String,
}

impl GoTrueVerifier {
    /// `project_url` is the Supabase project URL; the auth API lives under
    /// `/auth/v1`.
    pub fn new(project_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth_url: format!("{}/auth/v1", project_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl TokenVerifier for GoTrueVerifier {
    async fn verify(&self, token: &str) -> Result<String> {
        if token.is_empty() {
            return Err(RelayError::Unauthorized("empty token".to_string()));
        }

        let resp = self
            .client
            .get(format!("{}/user", self.auth_url))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RelayError::Unauthorized(format!("identity provider unreachable: {}", e)))?;

        if !resp.status().is_success() {
            return Err(RelayError::Unauthorized(format!(
                "identity provider rejected token: {}",
                resp.status()
            )));
        }

        let user: GoTrueUser = resp
            .json()
            .await
            .map_err(|e| RelayError::Unauthorized(format!("bad identity response: {}", e)))?;
        Ok(user.id)
    }
}

// ── Development ───────────────────────────────────────────────────────────────

/// Treats the token itself as the user ID. Local development and tests only.
#[derive(Debug, Clone, Default)]
pub struct DevTokenVerifier;

#[async_trait]
impl TokenVerifier for DevTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String> {
        let token = token.trim();
        if token.is_empty() {
            return Err(RelayError::Unauthorized("empty token".to_string()));
        }
        Ok(token.to_string())
    }
}
