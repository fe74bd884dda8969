//! OAuth 2.1 endpoints for protocol clients.
//!
//! - POST /register: dynamic client registration
//! - GET /authorize: validate the request, bind a CSRF cookie, render the form
//! - POST /authorize: store the tenant configuration, issue a code
//! - POST /token: redeem the code for a bearer access token

mod authorize;
mod form;

use super::error::AppError;
use crate::connections::ConnectionStore;
use crate::oauth::{
    AuthorizationCodeService, ClientRegistry, CodeError, CodeExchange, PendingAuthorizations,
    RegistrationError,
};
use crate::rate_limit::{enforce_rate_limit, RateLimitPolicy, RateLimiter};
use crate::upstream::TaskApi;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post, MethodRouter},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const CSRF_COOKIE: &str = "taskbridge_csrf";

/// Shared application state for the OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub clients: ClientRegistry,
    pub connections: ConnectionStore,
    pub codes: AuthorizationCodeService,
    pub pending: PendingAuthorizations,
    pub api: Arc<dyn TaskApi>,
    /// Recorded on stored connections
    pub server_id: String,
    pub rate_limits: Option<OAuthRateLimits>,
}

/// Per-caller limits for the OAuth endpoints.
#[derive(Clone)]
pub struct OAuthRateLimits {
    pub limiter: Arc<RateLimiter>,
    pub register_per_minute: u64,
    pub authorize_per_minute: u64,
    pub token_per_minute: u64,
    pub trust_forwarded_for: bool,
}

impl OAuthRateLimits {
    fn policy(&self, endpoint: &'static str, limit_per_minute: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            limiter: Arc::clone(&self.limiter),
            endpoint,
            limit_per_minute,
            trust_forwarded_for: self.trust_forwarded_for,
        }
    }
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    let limits = state.rate_limits.clone();
    let policy = |endpoint: &'static str, pick: fn(&OAuthRateLimits) -> u64| {
        limits
            .as_ref()
            .map(|limits| limits.policy(endpoint, pick(limits)))
    };

    Router::new()
        .route(
            "/register",
            limited(post(register), policy("register", |l| l.register_per_minute)),
        )
        .route(
            "/authorize",
            limited(
                get(authorize::authorize_form).post(authorize::authorize_submit),
                policy("authorize", |l| l.authorize_per_minute),
            ),
        )
        .route(
            "/token",
            limited(post(token), policy("token", |l| l.token_per_minute)),
        )
        .with_state(Arc::new(state))
}

fn limited(
    route: MethodRouter<Arc<OAuthAppState>>,
    policy: Option<RateLimitPolicy>,
) -> MethodRouter<Arc<OAuthAppState>> {
    match policy {
        Some(policy) => route.route_layer(middleware::from_fn_with_state(policy, enforce_rate_limit)),
        None => route,
    }
}

/// Client registration request (RFC 7591 subset)
#[derive(Deserialize, Default)]
#[serde(default)]
struct RegistrationRequest {
    redirect_uris: Option<Vec<String>>,
    client_name: Option<String>,
    token_endpoint_auth_method: Option<String>,
}

#[derive(Serialize)]
struct RegistrationResponse {
    client_id: String,
    client_id_issued_at: i64,
    token_endpoint_auth_method: String,
    redirect_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_name: Option<String>,
    grant_types: [&'static str; 1],
    response_types: [&'static str; 1],
}

/// POST /register
async fn register(State(state): State<Arc<OAuthAppState>>, body: Bytes) -> Result<Response, AppError> {
    let request: RegistrationRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request("invalid_client_metadata", format!("Invalid registration body: {}", e)))?;

    let redirect_uris = request.redirect_uris.unwrap_or_default();
    let client = state
        .clients
        .register(
            &redirect_uris,
            request.client_name.as_deref(),
            request.token_endpoint_auth_method.as_deref(),
        )
        .map_err(|e| match e {
            RegistrationError::MissingRedirectUris | RegistrationError::InvalidRedirectUri { .. } => {
                AppError::bad_request("invalid_redirect_uri", e.to_string())
            }
            RegistrationError::Storage(e) => {
                error!(error = %e, "Failed to store client registration");
                AppError::ServerError("Failed to register client".to_string())
            }
        })?;

    let response = RegistrationResponse {
        client_id: client.client_id,
        client_id_issued_at: client.issued_at,
        token_endpoint_auth_method: client.auth_method,
        redirect_uris: client.redirect_uris.into_iter().collect(),
        client_name: client.client_name,
        grant_types: ["authorization_code"],
        response_types: ["code"],
    };
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

/// Token request, form-encoded or JSON
#[derive(Deserialize, Default)]
#[serde(default)]
struct TokenRequest {
    grant_type: Option<String>,
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,
    client_id: Option<String>,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_in: Option<i64>,
}

/// POST /token
///
/// Token responses, errors included, are never cacheable.
async fn token(State(state): State<Arc<OAuthAppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = match exchange(&state, &headers, &body) {
        Ok(token) => (StatusCode::OK, Json(token)).into_response(),
        Err(e) => e.into_response(),
    };
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

fn exchange(state: &OAuthAppState, headers: &HeaderMap, body: &[u8]) -> Result<TokenResponse, AppError> {
    let request = parse_token_request(headers, body)?;

    match request.grant_type.as_deref() {
        Some("authorization_code") => {}
        Some(other) => {
            return Err(AppError::bad_request(
                "unsupported_grant_type",
                format!("Unsupported grant_type '{}'", other),
            ))
        }
        None => return Err(AppError::invalid_request("grant_type is required")),
    }

    let code = request
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::invalid_request("code is required"))?;

    let exchange = CodeExchange {
        code,
        redirect_uri: request.redirect_uri,
        code_verifier: request.code_verifier,
        client_id: request.client_id,
    };

    match state.codes.exchange_code(&exchange) {
        Ok(issued) => {
            info!(
                connection_id = %issued.connection_id,
                session_id = %issued.session_id,
                "Access token issued"
            );
            Ok(TokenResponse {
                access_token: issued.token,
                token_type: "Bearer",
                expires_in: issued.expires_in,
            })
        }
        Err(CodeError::Storage(e)) => {
            error!(error = %e, "Code exchange failed");
            Err(AppError::ServerError("Failed to exchange code".to_string()))
        }
        Err(e) => Err(AppError::bad_request("invalid_grant", e.to_string())),
    }
}

fn parse_token_request(headers: &HeaderMap, body: &[u8]) -> Result<TokenRequest, AppError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    if is_json {
        serde_json::from_slice(body).map_err(|e| {
            warn!(error = %e, "Malformed JSON token request");
            AppError::invalid_request("Malformed token request")
        })
    } else {
        serde_urlencoded::from_bytes(body).map_err(|e| {
            warn!(error = %e, "Malformed form token request");
            AppError::invalid_request("Malformed token request")
        })
    }
}
