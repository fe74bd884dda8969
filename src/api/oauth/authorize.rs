//! GET/POST /authorize.

use super::{form, OAuthAppState, CSRF_COOKIE};
use crate::api::error::AppError;
use crate::connections::TenantConfig;
use crate::crypto::secrets::constant_time_eq;
use crate::oauth::pkce::{self, S256};
use crate::oauth::{CodeBinding, PendingAuthorization};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{Html, IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

/// Authorization request query parameters
#[derive(Deserialize)]
pub(super) struct AuthorizeQuery {
    client_id: Option<String>,
    redirect_uri: Option<String>,
    response_type: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

/// GET /authorize
///
/// Errors are returned directly, never redirected: the redirect URI is not
/// trusted until it has been matched against the client's registration.
pub(super) async fn authorize_form(
    State(state): State<Arc<OAuthAppState>>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, AppError> {
    let client_id = query
        .client_id
        .ok_or_else(|| AppError::invalid_request("client_id is required"))?;

    let client = state
        .clients
        .get(&client_id)
        .map_err(|e| {
            error!(error = %e, "Failed to load client");
            AppError::ServerError("Failed to load client".to_string())
        })?
        .ok_or_else(|| {
            warn!(client_id = %client_id, "Authorization request for unknown client");
            AppError::bad_request("invalid_client", "Unknown client_id")
        })?;

    // A client with a single registered URI may omit it
    let redirect_uri = match query.redirect_uri {
        Some(uri) => uri,
        None if client.redirect_uris.len() == 1 => client.redirect_uris.iter().next().cloned().unwrap_or_default(),
        None => return Err(AppError::invalid_request("redirect_uri is required")),
    };
    if !client.allows_redirect(&redirect_uri) {
        warn!(client_id = %client_id, redirect_uri = %redirect_uri, "Unregistered redirect URI");
        return Err(AppError::invalid_request("redirect_uri is not registered for this client"));
    }

    if let Some(response_type) = query.response_type.as_deref() {
        if response_type != "code" {
            return Err(AppError::bad_request(
                "unsupported_response_type",
                "Only response_type=code is supported",
            ));
        }
    }

    let code_challenge = query
        .code_challenge
        .ok_or_else(|| AppError::invalid_request("code_challenge is required"))?;
    if !pkce::is_well_formed_challenge(&code_challenge) {
        return Err(AppError::invalid_request("code_challenge is malformed"));
    }
    let method = query.code_challenge_method.unwrap_or_default();
    if method != S256 {
        warn!(client_id = %client_id, method = %method, "Rejected non-S256 PKCE method");
        return Err(AppError::invalid_request("code_challenge_method must be S256"));
    }

    let pending = PendingAuthorization::new(
        &client_id,
        &redirect_uri,
        query.state.as_deref(),
        &code_challenge,
        &method,
    );
    let csrf_token = state.pending.create(pending.clone());
    let max_age = state.pending.expiry().num_seconds();

    debug!(client_id = %client_id, "Rendering authorization form");

    let page = form::render(&form::FormContext {
        client_name: client.client_name.as_deref().unwrap_or(&client.client_id),
        pending: &pending,
        csrf_token: &csrf_token,
    });

    let cookie = format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age={}",
        CSRF_COOKIE, csrf_token, max_age
    );
    let mut response = Html(page).into_response();
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|_| AppError::ServerError("Failed to build cookie".to_string()))?;
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// Form submission body
#[derive(Deserialize)]
pub(super) struct AuthorizeSubmission {
    client_id: String,
    #[serde(default)]
    name: Option<String>,
    config: Value,
    redirect_uri: String,
    #[serde(default)]
    state: Option<String>,
    code_challenge: String,
    code_challenge_method: String,
    csrf_token: String,
}

/// POST /authorize
///
/// The CSRF token must arrive both as the cookie set by GET /authorize and in
/// the body, and the submission must repeat the parameters recorded then.
pub(super) async fn authorize_submit(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let submission: AuthorizeSubmission = serde_json::from_slice(&body)
        .map_err(|e| AppError::invalid_request(format!("Malformed authorization submission: {}", e)))?;

    let cookie_token = csrf_cookie(&headers).ok_or_else(|| {
        warn!(client_id = %submission.client_id, "Authorization submission without CSRF cookie");
        AppError::Forbidden("Missing CSRF cookie".to_string())
    })?;
    if !constant_time_eq(&cookie_token, &submission.csrf_token) {
        warn!(client_id = %submission.client_id, "CSRF cookie does not match submitted token");
        return Err(AppError::Forbidden("CSRF token mismatch".to_string()));
    }

    let pending = state
        .pending
        .validate_and_consume(&submission.csrf_token)
        .ok_or_else(|| {
            warn!(client_id = %submission.client_id, "Unknown or expired authorization request");
            AppError::Forbidden("Authorization request expired or already used".to_string())
        })?;

    if !pending.matches(&submission.client_id, &submission.redirect_uri, &submission.code_challenge)
        || pending.code_challenge_method != submission.code_challenge_method
        || pending.state != submission.state
    {
        warn!(client_id = %submission.client_id, "Submission does not match the authorization request");
        return Err(AppError::invalid_request(
            "Submission does not match the authorization request",
        ));
    }

    let mut config = TenantConfig::from_json(submission.config)
        .map_err(|e| AppError::invalid_request(e.to_string()))?;

    if config.workspace_id.is_none() {
        let workspace_id = state.api.default_workspace(&config.api_key).await.map_err(|e| {
            warn!(client_id = %pending.client_id, error = %e, "Workspace lookup failed");
            AppError::invalid_request("Could not resolve a workspace for this API key")
        })?;
        config.workspace_id = Some(workspace_id);
    }

    let connection = state.connections.create(&state.server_id, &config).map_err(|e| {
        error!(error = %e, "Failed to store connection");
        AppError::ServerError("Failed to store configuration".to_string())
    })?;

    let code = state
        .codes
        .generate_code(&CodeBinding {
            connection_id: connection.id.clone(),
            client_id: Some(pending.client_id.clone()),
            redirect_uri: Some(pending.redirect_uri.clone()),
            code_challenge: Some(pending.code_challenge.clone()),
            code_challenge_method: Some(pending.code_challenge_method.clone()),
        })
        .map_err(|e| {
            error!(error = %e, "Failed to issue authorization code");
            AppError::ServerError("Failed to issue authorization code".to_string())
        })?;

    let mut redirect = Url::parse(&pending.redirect_uri)
        .map_err(|_| AppError::invalid_request("redirect_uri is not a valid URL"))?;
    {
        let mut pairs = redirect.query_pairs_mut();
        pairs.append_pair("code", &code);
        if let Some(state_param) = pending.state.as_deref() {
            pairs.append_pair("state", state_param);
        }
    }

    info!(
        client_id = %pending.client_id,
        connection_id = %connection.id,
        name = ?submission.name,
        write_mode = %config.write_mode,
        "Authorization granted"
    );

    Ok(Json(json!({ "redirectUrl": redirect.as_str() })).into_response())
}

fn csrf_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CSRF_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
