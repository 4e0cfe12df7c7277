//! HTTP surface: WebSocket upgrade, history sync and operational endpoints.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::bearer_token;
use crate::handler;
use crate::state::RelayState;
use crate::store::HistoryQuery;

/// Build the application router.
pub fn router(state: RelayState) -> Router {
    let origin = match HeaderValue::from_str(&state.config.frontend_url) {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(_) => {
            tracing::warn!(
                frontend_url = state.config.frontend_url.as_str(),
                "Invalid frontend URL, allowing any origin"
            );
            AllowOrigin::from(Any)
        }
    };

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/messages/history", get(history_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Check for an upgrade, authenticate, then upgrade.
///
/// GET /ws?token=<access token>
async fn ws_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<RelayState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let Some(ws) = ws else {
        return error_response(StatusCode::BAD_REQUEST, "WebSocket upgrade required");
    };

    let token = match query.token {
        Some(token) if !token.trim().is_empty() => token,
        _ => return error_response(StatusCode::UNAUTHORIZED, "Authentication token required"),
    };

    let user_id = match state.verifier.verify(&token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::info!(error = %e, "Rejected WebSocket upgrade");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid or expired token");
        }
    };

    tracing::info!(user_id = user_id.as_str(), "WebSocket upgrade");
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state, user_id))
}

// ── History ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub friend_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// RFC 3339. When present only newer messages are returned.
    pub since: Option<String>,
}

/// Conversation between the caller and `friend_id`, oldest first.
///
/// GET /api/messages/history?friend_id=...&limit=100&offset=0&since=...
async fn history_handler(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(bearer_token)
        .unwrap_or_default();
    if token.is_empty() {
        return error_response(StatusCode::UNAUTHORIZED, "Authentication token required");
    }

    let user_id = match state.verifier.verify(token).await {
        Ok(user_id) => user_id,
        Err(_) => return error_response(StatusCode::UNAUTHORIZED, "Invalid or expired token"),
    };

    let friend_id = match params.friend_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return error_response(StatusCode::BAD_REQUEST, "friend_id is required"),
    };

    let mut query = HistoryQuery::between(&user_id, &friend_id);
    if let Some(limit) = params.limit {
        query = query.with_limit(limit);
    }
    if let Some(offset) = params.offset {
        query = query.with_offset(offset);
    }
    if let Some(raw) = params.since.as_deref().filter(|s| !s.is_empty()) {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(since) => query = query.since(since.with_timezone(&Utc)),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "since must be RFC 3339"),
        }
    }

    match state.store.history(&query).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({
                "messages": messages,
                "current_user": user_id,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(
                user_id = user_id.as_str(),
                friend_id = friend_id.as_str(),
                error = %e,
                "Failed to fetch messages"
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch messages")
        }
    }
}

// ── Operational ───────────────────────────────────────────────────────────────

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "message": "Server is running",
    }))
}

async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_clients": state.online_count(),
        "pending_persistence": state.persister.queued(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
