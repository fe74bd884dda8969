//! Application assembly.
//!
//! Builds the owned service objects from configuration and merges the
//! routers. Without a master key the process serves a degraded router
//! (status and discovery only) rather than exiting.

use crate::api::{
    create_admin_router, create_discovery_router, create_mcp_router, create_oauth_router,
    create_status_router, AdminAppState, DiscoveryState, McpAppState, OAuthAppState,
    OAuthRateLimits, StatusAppState,
};
use crate::config::TaskBridgeConfig;
use crate::connections::ConnectionStore;
use crate::crypto::{EncryptionService, MasterKeySource};
use crate::oauth::{
    run_code_cleanup, run_pending_cleanup, AuthorizationCodeService, ClientRegistry,
    PendingAuthorizations, TokenService,
};
use crate::rate_limit::RateLimiter;
use crate::session::{ProtocolEngineFactory, SessionLimits, SessionManager};
use crate::store::Database;
use crate::upstream::TaskApi;
use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, StatusCode},
    response::{IntoResponse, Json},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use std::time::Duration;
use tracing::debug;

/// Rate-limit buckets idle this long are dropped by the maintenance task.
const RATE_LIMIT_IDLE_SECONDS: u64 = 600;

/// Owned services shared by the routers.
pub struct Services {
    pub key_source: Arc<MasterKeySource>,
    pub clients: ClientRegistry,
    pub connections: ConnectionStore,
    pub tokens: TokenService,
    pub codes: AuthorizationCodeService,
    pub pending: PendingAuthorizations,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
    pub api: Arc<dyn TaskApi>,
}

impl Services {
    /// Fails when no master key is configured or a TTL is out of range.
    pub fn new(
        config: &TaskBridgeConfig,
        db: Database,
        key_source: Arc<MasterKeySource>,
        api: Arc<dyn TaskApi>,
    ) -> Result<Self> {
        let encryption = EncryptionService::from_source(&key_source)?;
        let oauth = &config.oauth;

        let connections = ConnectionStore::new(db.clone(), encryption);
        let tokens = TokenService::new(
            db.clone(),
            connections.clone(),
            oauth.access_token_ttl()?,
        );
        let codes = AuthorizationCodeService::new(
            db.clone(),
            tokens.clone(),
            oauth.code_ttl()?,
        );
        let clients = ClientRegistry::new(db, oauth.allow_list());
        let pending = PendingAuthorizations::new(oauth.csrf_ttl()?);

        let sessions = Arc::new(
            SessionManager::new(
                Arc::new(tokens.clone()),
                Arc::new(ProtocolEngineFactory::new(Arc::clone(&api))),
                Arc::clone(&api),
            )
            .with_limits(SessionLimits {
                max_sessions: config.session.max_sessions,
                idle_timeout: Duration::from_secs(config.session.idle_timeout_seconds),
            }),
        );

        Ok(Self {
            key_source,
            clients,
            connections,
            tokens,
            codes,
            pending,
            sessions,
            limiter: Arc::new(RateLimiter::new()),
            api,
        })
    }
}

/// The full application router.
pub fn create_app(config: &TaskBridgeConfig, services: &Services) -> Router {
    let base_url = config.server.base_url.trim_end_matches('/').to_string();
    let limits = &config.rate_limit;

    let oauth_state = OAuthAppState {
        clients: services.clients.clone(),
        connections: services.connections.clone(),
        codes: services.codes.clone(),
        pending: services.pending.clone(),
        api: Arc::clone(&services.api),
        server_id: config.server.server_id.clone(),
        rate_limits: limits.enabled.then(|| OAuthRateLimits {
            limiter: Arc::clone(&services.limiter),
            register_per_minute: limits.register_per_minute,
            authorize_per_minute: limits.authorize_per_minute,
            token_per_minute: limits.token_per_minute,
            trust_forwarded_for: limits.trust_forwarded_for,
        }),
    };

    Router::new()
        .merge(create_oauth_router(oauth_state))
        .merge(create_mcp_router(McpAppState {
            sessions: Arc::clone(&services.sessions),
            base_url: base_url.clone(),
        }))
        .merge(create_discovery_router(DiscoveryState {
            base_url: base_url.clone(),
        }))
        .merge(create_status_router(StatusAppState {
            key_source: Arc::clone(&services.key_source),
            sessions: Some(Arc::clone(&services.sessions)),
        }))
        .merge(create_admin_router(AdminAppState {
            tokens: services.tokens.clone(),
            admin_token: config.server.admin_token.clone(),
        }))
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(cors_layer())
}

/// Status and discovery only; everything else answers 503.
pub fn create_degraded_app(config: &TaskBridgeConfig, key_source: Arc<MasterKeySource>) -> Router {
    let base_url = config.server.base_url.trim_end_matches('/').to_string();

    Router::new()
        .merge(create_discovery_router(DiscoveryState { base_url }))
        .merge(create_status_router(StatusAppState {
            key_source,
            sessions: None,
        }))
        .fallback(|| async {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "unconfigured",
                    "error_description": "Server has no master key configured"
                })),
            )
                .into_response()
        })
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("mcp-session-id"),
            HeaderName::from_static("www-authenticate"),
        ])
}

/// Spawns the periodic cleanup tasks.
pub fn spawn_maintenance(config: &TaskBridgeConfig, services: &Services) -> Vec<JoinHandle<()>> {
    let interval = config.oauth.cleanup_interval_seconds.max(1);
    let limiter = Arc::clone(&services.limiter);
    let sessions = Arc::clone(&services.sessions);

    vec![
        tokio::spawn(run_pending_cleanup(services.pending.clone(), interval)),
        tokio::spawn(run_code_cleanup(services.codes.clone(), interval)),
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                let removed = limiter.purge_idle(Duration::from_secs(RATE_LIMIT_IDLE_SECONDS));
                debug!(removed = removed, "Rate limit bucket cleanup complete");
            }
        }),
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                let closed = sessions.close_idle().await;
                debug!(closed = closed, live = sessions.count(), "Idle session sweep complete");
            }
        }),
    ]
}
