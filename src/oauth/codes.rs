//! One-time authorization codes bound to PKCE and a redirect URI.
//!
//! # Redemption
//!
//! The record is removed by the same statement that reads it
//! (`DELETE ... RETURNING`), under the database lock. Whatever happens next,
//! success or a terminal failure, the code cannot be redeemed again, and two
//! concurrent exchanges of the same code yield at most one success.

use super::pkce::{self, S256};
use super::tokens::{IssuedToken, TokenService};
use crate::crypto::secrets::{random_hex, sha256_hex};
use crate::store::Database;
use anyhow::Context;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

/// What a code is bound to at issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBinding {
    pub connection_id: String,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// Parameters presented at the token endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeExchange {
    pub code: String,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
}

/// Code redemption errors
#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    /// Unknown, already redeemed, or purged after expiry
    #[error("authorization code is invalid or has already been used")]
    InvalidCode,
    #[error("authorization code has expired")]
    CodeExpired,
    #[error("redirect_uri does not match the authorization request")]
    RedirectMismatch,
    #[error("client_id does not match the authorization request")]
    ClientMismatch,
    #[error("PKCE verification failed: {0}")]
    PkceFailure(&'static str),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Issues and redeems authorization codes.
#[derive(Clone)]
pub struct AuthorizationCodeService {
    db: Database,
    tokens: TokenService,
    ttl: Duration,
}

struct StoredCode {
    connection_id: String,
    client_id: Option<String>,
    redirect_uri: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    expires_at: i64,
}

impl AuthorizationCodeService {
    /// # Arguments
    /// * `ttl` - Code lifetime (recommended: 10 minutes)
    pub fn new(db: Database, tokens: TokenService, ttl: Duration) -> Self {
        Self { db, tokens, ttl }
    }

    /// Issues a code (256 random bits). Only its hash is stored; the raw
    /// value is returned once.
    pub fn generate_code(&self, binding: &CodeBinding) -> anyhow::Result<String> {
        let code = random_hex(32);
        let expires_at = (Utc::now() + self.ttl).timestamp_millis();

        self.db
            .lock()?
            .execute(
                r#"
                INSERT INTO auth_codes (
                    code_hash, connection_id, client_id, redirect_uri,
                    code_challenge, code_challenge_method, expires_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    sha256_hex(&code),
                    binding.connection_id,
                    binding.client_id,
                    binding.redirect_uri,
                    binding.code_challenge,
                    binding.code_challenge_method,
                    expires_at,
                ],
            )
            .context("Failed to store authorization code")?;

        info!(
            connection_id = %binding.connection_id,
            client_id = binding.client_id.as_deref().unwrap_or("-"),
            pkce = binding.code_challenge.is_some(),
            "Issued authorization code"
        );

        Ok(code)
    }

    /// Redeems a code for a session access token.
    ///
    /// # Errors
    /// * `InvalidCode` - Unknown or already consumed
    /// * `CodeExpired` - Past expiry (the record is purged)
    /// * `RedirectMismatch` - A redirect URI was bound and the supplied one differs or is missing
    /// * `ClientMismatch` - A client id was bound and a different one was supplied
    /// * `PkceFailure` - Challenge bound and verifier missing, wrong, or method not S256
    pub fn exchange_code(&self, exchange: &CodeExchange) -> Result<IssuedToken, CodeError> {
        let code_hash = sha256_hex(&exchange.code);
        let stored = self.take(&code_hash)?.ok_or(CodeError::InvalidCode)?;

        if stored.expires_at <= Utc::now().timestamp_millis() {
            warn!(connection_id = %stored.connection_id, "Expired authorization code presented");
            return Err(CodeError::CodeExpired);
        }

        // No redirect bound at issuance: any supplied redirect is accepted
        if let Some(bound) = &stored.redirect_uri {
            if exchange.redirect_uri.as_deref() != Some(bound.as_str()) {
                warn!(
                    connection_id = %stored.connection_id,
                    supplied = exchange.redirect_uri.as_deref().unwrap_or("-"),
                    "Authorization code redirect_uri mismatch"
                );
                return Err(CodeError::RedirectMismatch);
            }
        }

        if let (Some(bound), Some(supplied)) = (&stored.client_id, &exchange.client_id) {
            if bound != supplied {
                warn!(
                    connection_id = %stored.connection_id,
                    client_id = %supplied,
                    "Authorization code client_id mismatch"
                );
                return Err(CodeError::ClientMismatch);
            }
        }

        if let Some(challenge) = &stored.code_challenge {
            if let Err(reason) = check_pkce(
                challenge,
                stored.code_challenge_method.as_deref(),
                exchange.code_verifier.as_deref(),
            ) {
                warn!(
                    connection_id = %stored.connection_id,
                    reason = reason,
                    "PKCE verification failed"
                );
                return Err(CodeError::PkceFailure(reason));
            }
        }

        let issued = self.tokens.issue_access_token(&stored.connection_id)?;
        Ok(issued)
    }

    /// Atomically removes and returns a stored code.
    fn take(&self, code_hash: &str) -> anyhow::Result<Option<StoredCode>> {
        let conn = self.db.lock()?;
        conn.query_row(
            r#"
            DELETE FROM auth_codes WHERE code_hash = ?1
            RETURNING connection_id, client_id, redirect_uri,
                      code_challenge, code_challenge_method, expires_at
            "#,
            params![code_hash],
            |row| {
                Ok(StoredCode {
                    connection_id: row.get(0)?,
                    client_id: row.get(1)?,
                    redirect_uri: row.get(2)?,
                    code_challenge: row.get(3)?,
                    code_challenge_method: row.get(4)?,
                    expires_at: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to redeem authorization code")
    }

    /// Deletes every expired code. Returns the number removed.
    pub fn purge_expired(&self) -> anyhow::Result<usize> {
        let rows = self
            .db
            .lock()?
            .execute(
                "DELETE FROM auth_codes WHERE expires_at <= ?1",
                params![Utc::now().timestamp_millis()],
            )
            .context("Failed to purge expired codes")?;
        Ok(rows)
    }
}

fn check_pkce(challenge: &str, method: Option<&str>, verifier: Option<&str>) -> Result<(), &'static str> {
    if method != Some(S256) {
        return Err("unsupported code_challenge_method");
    }
    let verifier = verifier.ok_or("code_verifier is required")?;
    if !pkce::verify_s256(verifier, challenge) {
        return Err("code_verifier does not match code_challenge");
    }
    Ok(())
}

/// Background task to periodically purge expired codes and access tokens
pub async fn run_code_cleanup(codes: AuthorizationCodeService, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match (codes.purge_expired(), codes.tokens.purge_expired()) {
            (Ok(code_count), Ok(token_count)) => {
                tracing::debug!(codes = code_count, tokens = token_count, "Expired credential purge complete")
            }
            (Err(e), _) | (_, Err(e)) => tracing::error!(error = %e, "Expired credential purge failed"),
        }
    }
}

#[cfg(test)]
mod tests;
