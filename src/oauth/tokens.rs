//! Session access tokens and API keys.
//!
//! Both kinds are opaque random strings bound to one connection and one
//! session id. Only the SHA-256 hash is persisted; the raw value is handed
//! out exactly once at issuance.

use crate::connections::{ConnectionStore, TenantConfig};
use crate::crypto::secrets::{random_hex, sha256_hex};
use crate::session::{ResolvedSession, SessionTokenValidator};
use crate::store::Database;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

/// What a token was issued as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Issued by the token endpoint; expires
    AccessToken,
    /// Issued by an operator; does not expire
    ApiKey,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::AccessToken => "access_token",
            TokenKind::ApiKey => "api_key",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            TokenKind::AccessToken => "tbat_",
            TokenKind::ApiKey => "tbk_",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "access_token" => Ok(TokenKind::AccessToken),
            "api_key" => Ok(TokenKind::ApiKey),
            other => Err(anyhow!("unknown token kind '{}'", other)),
        }
    }
}

/// A freshly minted token. `token` is the only copy of the raw value.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub kind: TokenKind,
    pub connection_id: String,
    pub session_id: String,
    /// Seconds until expiry; `None` for API keys
    pub expires_in: Option<i64>,
}

/// A stored token resolved back to its tenant.
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub kind: TokenKind,
    pub connection_id: String,
    pub session_id: String,
    pub config: TenantConfig,
}

/// Issues and validates tokens, persisted as hashes in SQLite.
#[derive(Clone)]
pub struct TokenService {
    db: Database,
    connections: ConnectionStore,
    access_ttl: Duration,
}

impl TokenService {
    pub fn new(db: Database, connections: ConnectionStore, access_ttl: Duration) -> Self {
        Self {
            db,
            connections,
            access_ttl,
        }
    }

    /// Mints a bearer access token for a connection.
    pub fn issue_access_token(&self, connection_id: &str) -> Result<IssuedToken> {
        self.issue(TokenKind::AccessToken, connection_id, Some(self.access_ttl))
    }

    /// Mints a long-lived API key for an existing connection.
    pub fn issue_api_key(&self, connection_id: &str) -> Result<IssuedToken> {
        if !self.connection_exists(connection_id)? {
            return Err(anyhow!("connection '{}' not found", connection_id));
        }
        self.issue(TokenKind::ApiKey, connection_id, None)
    }

    pub fn connection_exists(&self, connection_id: &str) -> Result<bool> {
        Ok(self.connections.get(connection_id)?.is_some())
    }

    fn issue(&self, kind: TokenKind, connection_id: &str, ttl: Option<Duration>) -> Result<IssuedToken> {
        let token = format!("{}{}", kind.prefix(), random_hex(32));
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| (now + ttl).timestamp_millis());

        self.db
            .lock()?
            .execute(
                r#"
                INSERT INTO issued_tokens (token_hash, kind, connection_id, session_id, expires_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    sha256_hex(&token),
                    kind.as_str(),
                    connection_id,
                    session_id,
                    expires_at,
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to store issued token")?;

        info!(
            kind = kind.as_str(),
            connection_id = %connection_id,
            session_id = %session_id,
            "Issued token"
        );

        Ok(IssuedToken {
            token,
            kind,
            connection_id: connection_id.to_string(),
            session_id,
            expires_in: ttl.map(|ttl| ttl.num_seconds()),
        })
    }

    /// Resolves a raw token to its connection and decrypted configuration.
    ///
    /// Returns `Ok(None)` for unknown or expired tokens and for tokens whose
    /// connection no longer exists. Expired tokens are deleted on sight.
    pub fn resolve(&self, token: &str) -> Result<Option<ResolvedToken>> {
        let token_hash = sha256_hex(token);

        let row = {
            let conn = self.db.lock()?;
            conn.query_row(
                r#"
                SELECT kind, connection_id, session_id, expires_at
                FROM issued_tokens WHERE token_hash = ?1
                "#,
                params![token_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query issued token")?
        };

        let Some((kind, connection_id, session_id, expires_at)) = row else {
            return Ok(None);
        };

        if expires_at.is_some_and(|expires_at| expires_at <= Utc::now().timestamp_millis()) {
            debug!(session_id = %session_id, "Expired token presented");
            self.delete_hash(&token_hash)?;
            return Ok(None);
        }

        let Some(config) = self.connections.load_config(&connection_id)? else {
            return Ok(None);
        };

        Ok(Some(ResolvedToken {
            kind: TokenKind::parse(&kind)?,
            connection_id,
            session_id,
            config,
        }))
    }

    /// Deletes a token. Returns false if it did not exist.
    pub fn revoke(&self, token: &str) -> Result<bool> {
        self.delete_hash(&sha256_hex(token))
    }

    fn delete_hash(&self, token_hash: &str) -> Result<bool> {
        let rows = self
            .db
            .lock()?
            .execute(
                "DELETE FROM issued_tokens WHERE token_hash = ?1",
                params![token_hash],
            )
            .context("Failed to delete token")?;
        Ok(rows > 0)
    }

    /// Removes every expired access token. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let rows = self
            .db
            .lock()?
            .execute(
                "DELETE FROM issued_tokens WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![Utc::now().timestamp_millis()],
            )
            .context("Failed to purge expired tokens")?;
        Ok(rows)
    }
}

#[async_trait]
impl SessionTokenValidator for TokenService {
    async fn validate(&self, token: &str) -> Result<Option<ResolvedSession>> {
        Ok(self.resolve(token)?.map(|resolved| ResolvedSession {
            session_id: resolved.session_id,
            connection_id: Some(resolved.connection_id),
            config: resolved.config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionService, MasterKeySource};

    fn setup(access_ttl: Duration) -> (TokenService, ConnectionStore) {
        let db = Database::in_memory().unwrap();
        let source = MasterKeySource::new(Some("token-tests".to_string()), None);
        let connections = ConnectionStore::new(db.clone(), EncryptionService::from_source(&source).unwrap());
        (TokenService::new(db, connections.clone(), access_ttl), connections)
    }

    #[test]
    fn test_issue_and_validate_access_token() {
        let (tokens, connections) = setup(Duration::hours(1));
        let connection = connections.create("srv", &TenantConfig::new("pk_1")).unwrap();

        let issued = tokens.issue_access_token(&connection.id).unwrap();
        assert!(issued.token.starts_with("tbat_"));
        assert_eq!(issued.expires_in, Some(3600));

        let resolved = tokens.resolve(&issued.token).unwrap().unwrap();
        assert_eq!(resolved.kind, TokenKind::AccessToken);
        assert_eq!(resolved.connection_id, connection.id);
        assert_eq!(resolved.session_id, issued.session_id);
        assert_eq!(resolved.config.api_key, "pk_1");
    }

    #[test]
    fn test_only_hash_is_stored() {
        let (tokens, connections) = setup(Duration::hours(1));
        let connection = connections.create("srv", &TenantConfig::new("pk_1")).unwrap();
        let issued = tokens.issue_access_token(&connection.id).unwrap();

        let conn = tokens.db.lock().unwrap();
        let stored: String = conn
            .query_row("SELECT token_hash FROM issued_tokens", [], |row| row.get(0))
            .unwrap();
        assert_ne!(stored, issued.token);
        assert_eq!(stored, sha256_hex(&issued.token));
    }

    #[test]
    fn test_unknown_token() {
        let (tokens, _) = setup(Duration::hours(1));
        assert!(tokens.resolve("tbat_nope").unwrap().is_none());
    }

    #[test]
    fn test_expired_token_is_deleted() {
        let (tokens, connections) = setup(Duration::seconds(-1));
        let connection = connections.create("srv", &TenantConfig::new("pk_1")).unwrap();
        let issued = tokens.issue_access_token(&connection.id).unwrap();

        assert!(tokens.resolve(&issued.token).unwrap().is_none());
        assert!(!tokens.revoke(&issued.token).unwrap());
    }

    #[test]
    fn test_api_key_never_expires() {
        let (tokens, connections) = setup(Duration::seconds(-1));
        let connection = connections.create("srv", &TenantConfig::new("pk_1")).unwrap();
        let issued = tokens.issue_api_key(&connection.id).unwrap();

        assert!(issued.token.starts_with("tbk_"));
        assert!(issued.expires_in.is_none());
        assert_eq!(tokens.purge_expired().unwrap(), 0);

        let resolved = tokens.resolve(&issued.token).unwrap().unwrap();
        assert_eq!(resolved.kind, TokenKind::ApiKey);
    }

    #[test]
    fn test_api_key_requires_connection() {
        let (tokens, _) = setup(Duration::hours(1));
        assert!(tokens.issue_api_key("missing").is_err());
    }

    #[test]
    fn test_revoke() {
        let (tokens, connections) = setup(Duration::hours(1));
        let connection = connections.create("srv", &TenantConfig::new("pk_1")).unwrap();
        let issued = tokens.issue_access_token(&connection.id).unwrap();

        assert!(tokens.revoke(&issued.token).unwrap());
        assert!(tokens.resolve(&issued.token).unwrap().is_none());
    }

    #[test]
    fn test_each_token_gets_its_own_session() {
        let (tokens, connections) = setup(Duration::hours(1));
        let connection = connections.create("srv", &TenantConfig::new("pk_1")).unwrap();
        let a = tokens.issue_access_token(&connection.id).unwrap();
        let b = tokens.issue_access_token(&connection.id).unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.token, b.token);
    }
}
