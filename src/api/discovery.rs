//! OAuth discovery documents (RFC 8414, RFC 9728).

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;

/// State for the discovery endpoints
#[derive(Clone)]
pub struct DiscoveryState {
    /// Public base URL without trailing slash
    pub base_url: String,
}

pub fn create_discovery_router(state: DiscoveryState) -> Router {
    Router::new()
        .route("/.well-known/oauth-protected-resource", get(protected_resource))
        .route("/.well-known/oauth-protected-resource/mcp", get(protected_resource))
        .route("/.well-known/oauth-authorization-server", get(authorization_server))
        .with_state(Arc::new(state))
}

async fn protected_resource(State(state): State<Arc<DiscoveryState>>) -> Json<Value> {
    Json(json!({
        "resource": format!("{}/mcp", state.base_url),
        "authorization_servers": [state.base_url],
        "bearer_methods_supported": ["header"],
        "scopes_supported": []
    }))
}

async fn authorization_server(State(state): State<Arc<DiscoveryState>>) -> Json<Value> {
    let base = &state.base_url;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{}/authorize", base),
        "token_endpoint": format!("{}/token", base),
        "registration_endpoint": format!("{}/register", base),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"]
    }))
}
