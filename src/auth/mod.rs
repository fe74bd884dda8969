//! Credential extraction for the protocol endpoint.
//!
//! A request may authenticate with a bearer token, with an API key in one of
//! several header or query aliases, or only with a session id header (in
//! which case it inherits the session's credential).

use crate::connections::RawTenantParams;
use crate::session::{SessionCredential, SessionRequest};
use axum::http::HeaderMap;
use std::collections::HashMap;


pub const SESSION_HEADER: &str = "mcp-session-id";

const API_KEY_HEADERS: &[&str] = &["x-api-key", "x-task-api-key"];
const API_KEY_QUERY: &[&str] = &["api_key", "apiKey"];

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// First non-empty API key from the header aliases, then the query aliases.
pub fn extract_api_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    API_KEY_HEADERS
        .iter()
        .find_map(|name| header_value(headers, name))
        .or_else(|| API_KEY_QUERY.iter().find_map(|name| query_value(query, name)))
}

pub fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    header_value(headers, SESSION_HEADER)
}

/// Bearer token if an Authorization header is present, else an API key.
///
/// A malformed Authorization header is an error rather than falling through
/// to the API-key aliases.
pub fn extract_credential(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Option<SessionCredential>, TokenError> {
    match extract_bearer_token(headers) {
        Ok(token) => Ok(Some(SessionCredential::bearer(token))),
        Err(TokenError::Missing) => Ok(extract_api_key(headers, query).map(SessionCredential::api_key)),
        Err(e) => Err(e),
    }
}

/// Tenant settings for the raw API-key path. Headers win over query params.
pub fn extract_tenant_params(headers: &HeaderMap, query: &HashMap<String, String>) -> RawTenantParams {
    let pick = |header: &str, keys: [&str; 2]| {
        header_value(headers, header).or_else(|| keys.iter().find_map(|key| query_value(query, key)))
    };
    RawTenantParams {
        workspace_id: pick("x-workspace-id", ["workspace_id", "workspaceId"]),
        write_mode: pick("x-write-mode", ["write_mode", "writeMode"]),
        allowed_spaces: pick("x-allowed-spaces", ["allowed_spaces", "allowedSpaces"]),
        allowed_lists: pick("x-allowed-lists", ["allowed_lists", "allowedLists"]),
    }
}

/// Everything the session manager needs from one protocol request.
pub fn extract_session_request(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<SessionRequest, TokenError> {
    Ok(SessionRequest {
        session_id: extract_session_id(headers),
        credential: extract_credential(headers, query)?,
        tenant: extract_tenant_params(headers, query),
    })
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();

    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn query_value(query: &HashMap<String, String>, name: &str) -> Option<String> {
    query
        .get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>" or not valid header text
    InvalidFormat,
    /// Token is empty string
    Empty,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
        }
    }
}

impl std::error::Error for TokenError {}
