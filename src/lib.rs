// Application assembly (services, routers, maintenance tasks)
pub mod app;

// HTTP APIs
pub mod api;

// Credential extraction for the protocol endpoint
pub mod auth;

// TOML + environment configuration
pub mod config;

// Tenant configuration and its encrypted persistence
pub mod connections;

// Master key, AES-GCM, hashing helpers
pub mod crypto;

// Write-access policy for mutating tool calls
pub mod guard;

// Authorization server: clients, codes, tokens, CSRF, PKCE
pub mod oauth;

// Per-endpoint, per-caller rate limiting
pub mod rate_limit;

// Live protocol sessions
pub mod session;

// SQLite handle and schema
pub mod store;

// Upstream task API client and tool catalog
pub mod upstream;
