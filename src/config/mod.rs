use crate::oauth::{RedirectAllowList, RedirectMatchMode};
use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;

/// Longest accepted TTL for codes, tokens and forms (ten years).
pub const MAX_TTL_SECONDS: i64 = 10 * 365 * 24 * 3600;

/// Complete taskbridge configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskBridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL used in discovery documents and auth challenges
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Recorded on every stored connection
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Bearer token for the admin API; admin routes are disabled when unset
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_server_id() -> String {
    "taskbridge".to_string()
}

fn default_max_body_bytes() -> usize {
    1_048_576 // 1 MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            base_url: default_base_url(),
            server_id: default_server_id(),
            max_body_bytes: default_max_body_bytes(),
            admin_token: None,
        }
    }
}

/// SQLite configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "taskbridge.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Authorization server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_code_ttl")]
    pub code_ttl_seconds: i64,
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_seconds: i64,
    /// How long a rendered authorization form stays valid
    #[serde(default = "default_csrf_ttl")]
    pub csrf_ttl_seconds: i64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Redirect URIs clients may register; empty allows any http(s) URI
    #[serde(default)]
    pub redirect_allow_list: Vec<String>,
    #[serde(default)]
    pub redirect_match: RedirectMatchMode,
}

fn default_code_ttl() -> i64 {
    600
}

fn default_access_token_ttl() -> i64 {
    30 * 24 * 3600
}

fn default_csrf_ttl() -> i64 {
    600
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            code_ttl_seconds: default_code_ttl(),
            access_token_ttl_seconds: default_access_token_ttl(),
            csrf_ttl_seconds: default_csrf_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
            redirect_allow_list: Vec::new(),
            redirect_match: RedirectMatchMode::default(),
        }
    }
}

impl OAuthConfig {
    pub fn allow_list(&self) -> RedirectAllowList {
        RedirectAllowList::new(self.redirect_match, self.redirect_allow_list.clone())
    }

    pub fn code_ttl(&self) -> Result<Duration> {
        ttl("oauth.code_ttl_seconds", self.code_ttl_seconds)
    }

    pub fn access_token_ttl(&self) -> Result<Duration> {
        ttl("oauth.access_token_ttl_seconds", self.access_token_ttl_seconds)
    }

    pub fn csrf_ttl(&self) -> Result<Duration> {
        ttl("oauth.csrf_ttl_seconds", self.csrf_ttl_seconds)
    }
}

/// Per-caller limits for the OAuth endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_register_per_minute")]
    pub register_per_minute: u64,
    #[serde(default = "default_authorize_per_minute")]
    pub authorize_per_minute: u64,
    #[serde(default = "default_token_per_minute")]
    pub token_per_minute: u64,
    /// Key callers by the first X-Forwarded-For hop instead of the peer address
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_register_per_minute() -> u64 {
    10
}

fn default_authorize_per_minute() -> u64 {
    30
}

fn default_token_per_minute() -> u64 {
    30
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            register_per_minute: default_register_per_minute(),
            authorize_per_minute: default_authorize_per_minute(),
            token_per_minute: default_token_per_minute(),
            trust_forwarded_for: false,
        }
    }
}

/// Upstream task API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
}

fn default_upstream_url() -> String {
    "https://api.clickup.com/api".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            timeout_seconds: default_upstream_timeout(),
        }
    }
}

/// Live protocol session limits
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// New sessions are refused once this many are live and none is idle
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Sessions unused for this long are closed by the maintenance sweep
    #[serde(default = "default_session_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

fn default_max_sessions() -> usize {
    1000
}

fn default_session_idle_timeout() -> u64 {
    1800
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_seconds: default_session_idle_timeout(),
        }
    }
}

fn ttl(name: &str, seconds: i64) -> Result<Duration> {
    if !(1..=MAX_TTL_SECONDS).contains(&seconds) {
        bail!("{} must be between 1 and {} seconds, got {}", name, MAX_TTL_SECONDS, seconds);
    }
    Duration::try_seconds(seconds).with_context(|| format!("{} is out of range", name))
}

impl TaskBridgeConfig {
    /// Rejects values the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.oauth.code_ttl()?;
        self.oauth.access_token_ttl()?;
        self.oauth.csrf_ttl()?;
        if self.session.max_sessions == 0 {
            bail!("session.max_sessions must be at least 1");
        }
        if self.session.idle_timeout_seconds == 0 {
            bail!("session.idle_timeout_seconds must be at least 1");
        }
        Ok(())
    }

    /// Overrides fields from `TASKBRIDGE_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("TASKBRIDGE_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = get("TASKBRIDGE_BASE_URL") {
            self.server.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("TASKBRIDGE_SERVER_ID") {
            self.server.server_id = v;
        }
        if let Some(v) = get("TASKBRIDGE_ADMIN_TOKEN") {
            self.server.admin_token = Some(v);
        }
        if let Some(v) = get("TASKBRIDGE_DB_PATH") {
            self.database.path = v;
        }
        if let Some(n) = get("TASKBRIDGE_CODE_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.oauth.code_ttl_seconds = n;
        }
        if let Some(n) = get("TASKBRIDGE_ACCESS_TOKEN_TTL_SECONDS").and_then(|v| v.parse().ok()) {
            self.oauth.access_token_ttl_seconds = n;
        }
        if let Some(v) = get("TASKBRIDGE_REDIRECT_ALLOW_LIST") {
            self.oauth.redirect_allow_list = v
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }
        match get("TASKBRIDGE_REDIRECT_MATCH").as_deref() {
            Some("exact") => self.oauth.redirect_match = RedirectMatchMode::Exact,
            Some("prefix") => self.oauth.redirect_match = RedirectMatchMode::Prefix,
            _ => {}
        }
        if let Some(b) = get("TASKBRIDGE_RATE_LIMIT_ENABLED").and_then(|v| v.parse().ok()) {
            self.rate_limit.enabled = b;
        }
        if let Some(b) = get("TASKBRIDGE_TRUST_FORWARDED_FOR").and_then(|v| v.parse().ok()) {
            self.rate_limit.trust_forwarded_for = b;
        }
        if let Some(v) = get("TASKBRIDGE_UPSTREAM_URL") {
            self.upstream.base_url = v;
        }
        if let Some(n) = get("TASKBRIDGE_UPSTREAM_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
            self.upstream.timeout_seconds = n;
        }
        if let Some(n) = get("TASKBRIDGE_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
            self.session.max_sessions = n;
        }
        if let Some(n) = get("TASKBRIDGE_SESSION_IDLE_SECONDS").and_then(|v| v.parse().ok()) {
            self.session.idle_timeout_seconds = n;
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<TaskBridgeConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    let config: TaskBridgeConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path))?;
    Ok(config)
}
