//! Shared SQLite handle.
//!
//! Clients, connections, authorization codes and issued tokens live in one
//! database file. Each store holds a clone of [`Database`]; statements are
//! serialized through a single mutex-guarded connection, which is also what
//! makes code redemption an atomic take.

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Schema, created on open if missing.
///
/// Timestamps used for expiry checks are unix milliseconds; informational
/// timestamps are RFC 3339 text.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    client_id    TEXT PRIMARY KEY,
    client_name  TEXT,
    redirect_uris TEXT NOT NULL,
    auth_method  TEXT NOT NULL,
    issued_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS connections (
    id               TEXT PRIMARY KEY,
    server_id        TEXT NOT NULL,
    encrypted_config TEXT NOT NULL,
    fingerprint_hash TEXT NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connections_fingerprint ON connections(fingerprint_hash);

CREATE TABLE IF NOT EXISTS auth_codes (
    code_hash             TEXT PRIMARY KEY,
    connection_id         TEXT NOT NULL,
    client_id             TEXT,
    redirect_uri          TEXT,
    code_challenge        TEXT,
    code_challenge_method TEXT,
    expires_at            INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS issued_tokens (
    token_hash    TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    connection_id TEXT NOT NULL,
    session_id    TEXT NOT NULL,
    expires_at    INTEGER,
    created_at    TEXT NOT NULL
);
"#;

/// Mutex-guarded SQLite connection shared by all stores.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database file and ensures the schema exists.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, degraded runs).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }
}
