//! Tenant configuration and its encrypted persistence.
//!
//! A *connection* is one stored, encrypted tenant configuration. Connections
//! are immutable: re-authorizing a tenant creates a new record.

use crate::crypto::secrets::sha256_hex;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

mod store;

pub use store::ConnectionStore;

/// Write policy for mutating tool calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Every mutating call is permitted
    #[default]
    Write,
    /// Every mutating call is denied
    Read,
    /// Mutating calls must resolve to allow-listed spaces/lists
    Selective,
}

impl FromStr for WriteMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "write" => Ok(WriteMode::Write),
            "read" => Ok(WriteMode::Read),
            "selective" => Ok(WriteMode::Selective),
            other => Err(ConfigError::InvalidWriteMode(other.to_string())),
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteMode::Write => "write",
            WriteMode::Read => "read",
            WriteMode::Selective => "selective",
        };
        f.write_str(name)
    }
}

/// Tenant configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("api_key is required")]
    MissingApiKey,
    #[error("invalid write mode '{0}' (expected write, read or selective)")]
    InvalidWriteMode(String),
    #[error("selective write mode requires at least one allowed space or list")]
    EmptySelectiveScope,
    #[error("invalid tenant configuration: {0}")]
    Malformed(String),
}

/// Per-tenant settings needed to call the upstream API on the tenant's behalf.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Upstream API key (secret)
    #[serde(alias = "apiKey")]
    pub api_key: String,

    /// Upstream workspace (team) id; resolved upstream when absent
    #[serde(
        default,
        alias = "workspaceId",
        alias = "team_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub workspace_id: Option<String>,

    #[serde(default, alias = "writeMode")]
    pub write_mode: WriteMode,

    #[serde(default, alias = "allowedSpaces")]
    pub allowed_spaces: BTreeSet<String>,

    #[serde(default, alias = "allowedLists")]
    pub allowed_lists: BTreeSet<String>,
}

impl fmt::Debug for TenantConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConfig")
            .field("api_key", &"<redacted>")
            .field("workspace_id", &self.workspace_id)
            .field("write_mode", &self.write_mode)
            .field("allowed_spaces", &self.allowed_spaces)
            .field("allowed_lists", &self.allowed_lists)
            .finish()
    }
}

/// Tenant settings carried on a raw API-key request (headers or query).
///
/// List values are comma separated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTenantParams {
    pub workspace_id: Option<String>,
    pub write_mode: Option<String>,
    pub allowed_spaces: Option<String>,
    pub allowed_lists: Option<String>,
}

impl TenantConfig {
    /// A configuration with full write access and no workspace id yet.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            workspace_id: None,
            write_mode: WriteMode::Write,
            allowed_spaces: BTreeSet::new(),
            allowed_lists: BTreeSet::new(),
        }
    }

    /// Parses and validates a configuration submitted as JSON.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        let mut config: TenantConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration for the raw API-key path.
    pub fn from_raw(api_key: &str, params: &RawTenantParams) -> Result<Self, ConfigError> {
        let mut config = TenantConfig::new(api_key);
        config.workspace_id = params.workspace_id.clone();
        if let Some(mode) = &params.write_mode {
            config.write_mode = mode.parse()?;
        }
        config.allowed_spaces = split_list(params.allowed_spaces.as_deref());
        config.allowed_lists = split_list(params.allowed_lists.as_deref());
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        self.api_key = self.api_key.trim().to_string();
        self.workspace_id = self
            .workspace_id
            .take()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if self.write_mode == WriteMode::Selective
            && self.allowed_spaces.is_empty()
            && self.allowed_lists.is_empty()
        {
            return Err(ConfigError::EmptySelectiveScope);
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form. Stored instead of plaintext for
    /// deduplication and audit.
    pub fn fingerprint(&self) -> String {
        // Field order is fixed and sets are ordered, so the JSON is canonical
        let canonical = serde_json::to_string(self).unwrap_or_default();
        sha256_hex(&canonical)
    }
}

fn split_list(raw: Option<&str>) -> BTreeSet<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// A stored, encrypted tenant configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub server_id: String,
    pub encrypted_config: String,
    pub fingerprint_hash: String,
    pub created_at: DateTime<Utc>,
}
