//! Protocol session endpoint.
//!
//! POST /mcp carries JSON-RPC messages (single or batched). The response
//! always names the session in the `mcp-session-id` header. DELETE /mcp
//! closes the session.

use super::error::AppError;
use crate::auth::{extract_session_request, SESSION_HEADER};
use crate::session::engine::PARSE_ERROR;
use crate::session::{Session, SessionError, SessionManager};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Shared state for the protocol endpoint
#[derive(Clone)]
pub struct McpAppState {
    pub sessions: Arc<SessionManager>,
    /// Public base URL, used in authentication challenges
    pub base_url: String,
}

pub fn create_mcp_router(state: McpAppState) -> Router {
    Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .with_state(Arc::new(state))
}

/// POST /mcp
async fn handle_post(
    State(state): State<Arc<McpAppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Unparseable protocol message");
            let error = json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": PARSE_ERROR, "message": "parse error" }
            });
            return Ok((StatusCode::BAD_REQUEST, Json(error)).into_response());
        }
    };

    let session = open_session(&state, &headers, &query).await?;
    let engine = session.engine();

    let reply = match message {
        Value::Array(batch) => {
            let mut replies = Vec::new();
            for item in batch {
                if let Some(reply) = engine.handle(item).await {
                    replies.push(reply);
                }
            }
            (!replies.is_empty()).then(|| Value::Array(replies))
        }
        single => engine.handle(single).await,
    };

    let mut response = match reply {
        Some(reply) => (StatusCode::OK, Json(reply)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&session.session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

/// DELETE /mcp
async fn handle_delete(
    State(state): State<Arc<McpAppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    if headers.get(SESSION_HEADER).is_none() {
        return Err(AppError::invalid_request("mcp-session-id header is required"));
    }
    let session = open_session(&state, &headers, &query).await?;
    state.sessions.close(&session.session_id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn open_session(
    state: &McpAppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Arc<Session>, AppError> {
    let request = extract_session_request(headers, query).map_err(|e| {
        warn!(error = %e, "Malformed protocol credential");
        AppError::unauthorized(&state.base_url, e.to_string())
    })?;

    state.sessions.resolve(request).await.map_err(|e| match e {
        SessionError::SessionNotFound => AppError::NotFound("Session not found".to_string()),
        SessionError::CredentialMismatch
        | SessionError::AuthenticationRequired
        | SessionError::InvalidSessionToken
        | SessionError::WorkspaceUnresolved(_) => AppError::unauthorized(&state.base_url, e.to_string()),
        SessionError::InvalidConfig(e) => AppError::invalid_request(e.to_string()),
        SessionError::CapacityExceeded => AppError::Unavailable("Too many live sessions, retry later".to_string()),
        SessionError::Internal(e) => {
            error!(error = %e, "Session resolution failed");
            AppError::ServerError("Failed to open session".to_string())
        }
    })
}
