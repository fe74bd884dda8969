//! Dynamic client registration (RFC 7591 subset).
//!
//! Clients are public (no secret). A client is identified by an opaque
//! 32-character hex id and the exact set of redirect URIs it registered.

use crate::crypto::secrets::random_hex;
use crate::store::Database;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};
use url::Url;

/// Default `token_endpoint_auth_method` for public clients.
pub const DEFAULT_AUTH_METHOD: &str = "none";

/// How operator allow-list entries are matched against redirect URIs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMatchMode {
    #[default]
    Exact,
    Prefix,
}

/// Operator-configured redirect URI allow-list. Empty means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectAllowList {
    pub mode: RedirectMatchMode,
    pub entries: Vec<String>,
}

impl RedirectAllowList {
    pub fn new(mode: RedirectMatchMode, entries: Vec<String>) -> Self {
        Self { mode, entries }
    }

    pub fn permits(&self, uri: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries.iter().any(|entry| match self.mode {
            RedirectMatchMode::Exact => entry == uri,
            RedirectMatchMode::Prefix => uri.starts_with(entry.as_str()),
        })
    }
}

/// A dynamically registered OAuth client. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_name: Option<String>,
    pub redirect_uris: BTreeSet<String>,
    pub auth_method: String,
    /// Unix seconds
    pub issued_at: i64,
}

impl RegisteredClient {
    /// Exact-match check against the registered redirect URIs.
    pub fn allows_redirect(&self, uri: &str) -> bool {
        self.redirect_uris.contains(uri)
    }
}

/// Registration errors
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("at least one redirect URI is required")]
    MissingRedirectUris,
    #[error("invalid redirect URI '{uri}': {reason}")]
    InvalidRedirectUri { uri: String, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Registry of dynamically registered clients, persisted in SQLite.
#[derive(Clone)]
pub struct ClientRegistry {
    db: Database,
    allow_list: RedirectAllowList,
}

impl ClientRegistry {
    pub fn new(db: Database, allow_list: RedirectAllowList) -> Self {
        Self { db, allow_list }
    }

    /// Registers a new client.
    ///
    /// Every URI must parse with an `http` or `https` scheme and satisfy the
    /// operator allow-list, if one is configured.
    pub fn register(
        &self,
        redirect_uris: &[String],
        client_name: Option<&str>,
        auth_method: Option<&str>,
    ) -> Result<RegisteredClient, RegistrationError> {
        if redirect_uris.is_empty() {
            return Err(RegistrationError::MissingRedirectUris);
        }

        for uri in redirect_uris {
            if let Err(reason) = self.check_redirect_uri(uri) {
                warn!(redirect_uri = %uri, reason = %reason, "Rejected client registration");
                return Err(RegistrationError::InvalidRedirectUri {
                    uri: uri.clone(),
                    reason,
                });
            }
        }

        let client = RegisteredClient {
            client_id: random_hex(16),
            client_name: client_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            redirect_uris: redirect_uris.iter().cloned().collect(),
            auth_method: auth_method
                .map(str::trim)
                .filter(|method| !method.is_empty())
                .unwrap_or(DEFAULT_AUTH_METHOD)
                .to_string(),
            issued_at: Utc::now().timestamp(),
        };

        let uris_json =
            serde_json::to_string(&client.redirect_uris).context("Failed to encode redirect URIs")?;

        self.db
            .lock()?
            .execute(
                r#"
                INSERT INTO clients (client_id, client_name, redirect_uris, auth_method, issued_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    client.client_id,
                    client.client_name,
                    uris_json,
                    client.auth_method,
                    client.issued_at,
                ],
            )
            .context("Failed to store client")?;

        info!(
            client_id = %client.client_id,
            redirect_uri_count = client.redirect_uris.len(),
            "Registered OAuth client"
        );

        Ok(client)
    }

    fn check_redirect_uri(&self, uri: &str) -> Result<(), String> {
        let parsed = Url::parse(uri).map_err(|e| e.to_string())?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("scheme '{}' is not allowed", parsed.scheme()));
        }
        if !self.allow_list.permits(uri) {
            return Err("not permitted by the redirect URI allow-list".to_string());
        }
        Ok(())
    }

    /// Read-only lookup.
    pub fn get(&self, client_id: &str) -> Result<Option<RegisteredClient>> {
        let conn = self.db.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT client_id, client_name, redirect_uris, auth_method, issued_at
                FROM clients WHERE client_id = ?1
                "#,
                params![client_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query client")?;

        let Some((client_id, client_name, uris_json, auth_method, issued_at)) = row else {
            return Ok(None);
        };

        let redirect_uris = serde_json::from_str(&uris_json)
            .with_context(|| format!("Corrupt redirect URIs for client {}", client_id))?;

        Ok(Some(RegisteredClient {
            client_id,
            client_name,
            redirect_uris,
            auth_method,
            issued_at,
        }))
    }
}
