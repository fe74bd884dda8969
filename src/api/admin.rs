use super::error::AppError;
use crate::crypto::secrets::constant_time_eq;
use crate::oauth::TokenService;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// State for the admin API.
#[derive(Clone)]
pub struct AdminAppState {
    pub tokens: TokenService,
    /// Required bearer token. None = admin API disabled.
    pub admin_token: Option<String>,
}

#[derive(Deserialize)]
pub struct RevokeRequest {
    pub api_key: String,
}

pub fn create_admin_router(state: AdminAppState) -> Router {
    Router::new()
        .route("/api/connections/:id/api-keys", post(issue_api_key))
        .route("/api/api-keys/revoke", post(revoke_api_key))
        .with_state(Arc::new(state))
}

/// POST /api/connections/:id/api-keys: mints a long-lived API key for a
/// stored connection. The key is returned once.
async fn issue_api_key(
    State(state): State<Arc<AdminAppState>>,
    Path(connection_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    authorize_admin(&headers, &state.admin_token)?;

    let exists = state
        .tokens
        .connection_exists(&connection_id)
        .map_err(|e| {
            error!(error = %e, "Failed to look up connection");
            AppError::ServerError("Failed to look up connection".to_string())
        })?;
    if !exists {
        return Err(AppError::NotFound(format!("Connection '{}' not found", connection_id)));
    }

    let issued = state.tokens.issue_api_key(&connection_id).map_err(|e| {
        error!(error = %e, "Failed to issue api key");
        AppError::ServerError("Failed to issue api key".to_string())
    })?;

    info!(connection_id = %connection_id, session_id = %issued.session_id, "Admin issued api key");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "api_key": issued.token,
            "connection_id": issued.connection_id,
            "session_id": issued.session_id,
        })),
    )
        .into_response())
}

/// POST /api/api-keys/revoke
async fn revoke_api_key(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
    Json(request): Json<RevokeRequest>,
) -> Result<Response, AppError> {
    authorize_admin(&headers, &state.admin_token)?;

    let revoked = state.tokens.revoke(&request.api_key).map_err(|e| {
        error!(error = %e, "Failed to revoke api key");
        AppError::ServerError("Failed to revoke api key".to_string())
    })?;
    info!(revoked = revoked, "Admin api key revocation");
    Ok(Json(json!({ "revoked": revoked })).into_response())
}

/// Checks `Authorization: Bearer <admin token>`. With no token configured
/// the admin API answers 404.
fn authorize_admin(headers: &HeaderMap, expected: &Option<String>) -> Result<(), AppError> {
    let Some(expected_token) = expected else {
        return Err(AppError::NotFound("Admin API is disabled".to_string()));
    };

    let token = headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) if constant_time_eq(token, expected_token) => Ok(()),
        _ => {
            warn!("Rejected admin request with invalid token");
            Err(AppError::Unauthorized {
                description: "Invalid admin token".to_string(),
                resource_metadata: None,
            })
        }
    }
}
