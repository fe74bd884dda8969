use crate::crypto::MasterKeySource;
use crate::session::SessionManager;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;

/// State for GET /api/status
#[derive(Clone)]
pub struct StatusAppState {
    pub key_source: Arc<MasterKeySource>,
    /// `None` when running degraded without a master key
    pub sessions: Option<Arc<SessionManager>>,
}

pub fn create_status_router(state: StatusAppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .with_state(Arc::new(state))
}

/// GET /api/status
///
/// Reports `unconfigured` instead of failing when no master key is set.
async fn status(State(state): State<Arc<StatusAppState>>) -> Json<Value> {
    let ready = state.key_source.is_configured() && state.sessions.is_some();
    Json(json!({
        "status": if ready { "ready" } else { "unconfigured" },
        "version": env!("CARGO_PKG_VERSION"),
        "master_key": state.key_source.info(),
        "sessions": state.sessions.as_ref().map_or(0, |sessions| sessions.count()),
    }))
}
