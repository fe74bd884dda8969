use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// Error response (OAuth style)
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    error_description: String,
}

/// Application error types for the HTTP API
#[derive(Debug)]
pub enum AppError {
    /// 400 with a machine-readable code
    BadRequest {
        code: &'static str,
        description: String,
    },
    /// 401; `resource_metadata` adds the discovery hint to `WWW-Authenticate`
    Unauthorized {
        description: String,
        resource_metadata: Option<String>,
    },
    Forbidden(String),
    NotFound(String),
    /// 503 while the gateway is at capacity
    Unavailable(String),
    ServerError(String),
}

impl AppError {
    pub fn bad_request(code: &'static str, description: impl Into<String>) -> Self {
        AppError::BadRequest {
            code,
            description: description.into(),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::bad_request("invalid_request", description)
    }

    /// 401 pointing the client at the protected-resource metadata under `base_url`.
    pub fn unauthorized(base_url: &str, description: impl Into<String>) -> Self {
        AppError::Unauthorized {
            description: description.into(),
            resource_metadata: Some(format!("{}/.well-known/oauth-protected-resource", base_url)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, description, challenge) = match self {
            AppError::BadRequest { code, description } => (StatusCode::BAD_REQUEST, code, description, None),
            AppError::Unauthorized {
                description,
                resource_metadata,
            } => {
                let challenge = match resource_metadata {
                    Some(url) => format!("Bearer resource_metadata=\"{}\"", url),
                    None => "Bearer".to_string(),
                };
                (StatusCode::UNAUTHORIZED, "invalid_token", description, Some(challenge))
            }
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "access_denied", msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "temporarily_unavailable", msg, None),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", msg, None),
        };

        let body = Json(ErrorResponse {
            error: code,
            error_description: description,
        });

        let mut response = (status, body).into_response();
        if let Some(challenge) = challenge.and_then(|c| HeaderValue::from_str(&c).ok()) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
        }
        response
    }
}
