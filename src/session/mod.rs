//! Multi-tenant session routing.
//!
//! A session binds one credential to one decrypted tenant configuration and
//! one running [`Engine`]. Sessions live in memory only; the
//! [`SessionManager`] is the single owner of the live set.

use crate::connections::{ConfigError, RawTenantParams, TenantConfig};
use crate::crypto::secrets::constant_time_eq;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub mod engine;
mod manager;

pub use engine::{Engine, EngineFactory, ProtocolEngine, ProtocolEngineFactory};
pub use manager::{SessionLimits, SessionManager};

/// How a credential reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// `Authorization: Bearer` header; must resolve to a stored token
    Bearer,
    /// API-key header or query parameter; may be a raw upstream key
    ApiKey,
}

/// A request-scoped credential. Never persisted.
#[derive(Clone)]
pub struct SessionCredential {
    pub token: String,
    pub provenance: Provenance,
}

impl SessionCredential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            provenance: Provenance::Bearer,
        }
    }

    pub fn api_key(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            provenance: Provenance::ApiKey,
        }
    }

    /// Same secret, compared in constant time. Provenance is not compared.
    pub fn matches(&self, other: &SessionCredential) -> bool {
        constant_time_eq(&self.token, &other.token)
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &"<redacted>")
            .field("provenance", &self.provenance)
            .finish()
    }
}

/// A stored credential resolved to its tenant.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session_id: String,
    pub connection_id: Option<String>,
    pub config: TenantConfig,
}

/// Resolves credentials that were issued by this server.
#[async_trait]
pub trait SessionTokenValidator: Send + Sync {
    /// `Ok(None)` when the credential is not one of ours (or has expired).
    async fn validate(&self, token: &str) -> Result<Option<ResolvedSession>>;
}

/// What the protocol endpoint extracted from one request.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub session_id: Option<String>,
    pub credential: Option<SessionCredential>,
    /// Tenant settings for the raw API-key path
    pub tenant: RawTenantParams,
}

/// Session routing errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    SessionNotFound,

    #[error("credential does not match the session")]
    CredentialMismatch,

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("invalid or expired session token")]
    InvalidSessionToken,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("could not resolve workspace for api key: {0}")]
    WorkspaceUnresolved(String),

    #[error("too many live sessions")]
    CapacityExceeded,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A live session.
pub struct Session {
    pub session_id: String,
    pub credential: SessionCredential,
    pub config: Arc<TenantConfig>,
    /// Stored connection backing the session; `None` on the raw API-key path
    pub connection_id: Option<String>,
    engine: Arc<dyn Engine>,
    /// Unix millis of the last request routed to the session
    last_used: AtomicI64,
}

impl Session {
    pub(crate) fn new(
        session_id: String,
        credential: SessionCredential,
        config: Arc<TenantConfig>,
        connection_id: Option<String>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        Self {
            session_id,
            credential,
            config,
            connection_id,
            engine,
            last_used: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn touch(&self) {
        self.last_used
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, millis: i64) {
        self.last_used.fetch_sub(millis, Ordering::Relaxed);
    }

    /// Milliseconds since the last request, as of `now_millis`.
    pub fn idle_millis(&self, now_millis: i64) -> i64 {
        now_millis - self.last_used.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("credential", &self.credential)
            .field("config", &self.config)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_matches_ignores_provenance() {
        let a = SessionCredential::bearer("tok");
        let b = SessionCredential::api_key("tok");
        assert!(a.matches(&b));
        assert!(!a.matches(&SessionCredential::bearer("other")));
    }

    #[test]
    fn test_credential_debug_redacts_token() {
        let rendered = format!("{:?}", SessionCredential::api_key("pk_secret"));
        assert!(!rendered.contains("pk_secret"));
        assert!(rendered.contains("ApiKey"));
    }
}
