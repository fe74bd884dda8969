//! Encrypted connection storage using SQLite.
//!
//! Tenant configurations are serialized to JSON and encrypted with
//! AES-256-GCM before they are written; only the fingerprint hash is stored
//! in the clear.

use super::{Connection, TenantConfig};
use crate::crypto::EncryptionService;
use crate::store::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

/// Encrypted tenant configuration storage.
///
/// # Schema
/// ```sql
/// CREATE TABLE connections (
///     id               TEXT PRIMARY KEY,
///     server_id        TEXT NOT NULL,
///     encrypted_config TEXT NOT NULL,   -- nonce:tag:ciphertext (hex)
///     fingerprint_hash TEXT NOT NULL,   -- SHA-256 of the plaintext JSON
///     created_at       TEXT NOT NULL    -- ISO 8601 timestamp
/// );
/// ```
///
/// # Security
/// - Plaintext configuration never touches disk
/// - Records are never updated in place; a new configuration is a new row
#[derive(Clone)]
pub struct ConnectionStore {
    db: Database,
    encryption: EncryptionService,
}

impl ConnectionStore {
    pub fn new(db: Database, encryption: EncryptionService) -> Self {
        Self { db, encryption }
    }

    /// Encrypts and stores a tenant configuration as a new connection.
    ///
    /// # Arguments
    /// * `server_id` - Identifier of this deployment
    /// * `config` - Validated tenant configuration
    pub fn create(&self, server_id: &str, config: &TenantConfig) -> Result<Connection> {
        let plaintext =
            serde_json::to_string(config).context("Failed to serialize tenant configuration")?;
        let encrypted_config = self
            .encryption
            .encrypt(&plaintext)
            .context("Failed to encrypt tenant configuration")?;

        let connection = Connection {
            id: Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            encrypted_config,
            fingerprint_hash: config.fingerprint(),
            created_at: Utc::now(),
        };

        self.db
            .lock()?
            .execute(
                r#"
                INSERT INTO connections (id, server_id, encrypted_config, fingerprint_hash, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    connection.id,
                    connection.server_id,
                    connection.encrypted_config,
                    connection.fingerprint_hash,
                    connection.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to store connection")?;

        Ok(connection)
    }

    /// Looks up a connection record (still encrypted).
    pub fn get(&self, id: &str) -> Result<Option<Connection>> {
        let conn = self.db.lock()?;
        conn.query_row(
            r#"
            SELECT id, server_id, encrypted_config, fingerprint_hash, created_at
            FROM connections WHERE id = ?1
            "#,
            params![id],
            read_row,
        )
        .optional()
        .context("Failed to query connection")?
        .map(parse_row)
        .transpose()
    }

    /// Decrypts the configuration held by a connection.
    ///
    /// # Errors
    /// Fails if the blob does not authenticate under the current master key
    /// (tampered, or sealed before a key rotation).
    pub fn decrypt_config(&self, connection: &Connection) -> Result<TenantConfig> {
        let plaintext = self
            .encryption
            .decrypt(&connection.encrypted_config)
            .with_context(|| format!("Failed to decrypt connection {}", connection.id))?;
        serde_json::from_str(&plaintext)
            .with_context(|| format!("Stored configuration for {} is not valid", connection.id))
    }

    /// Loads and decrypts the configuration of a connection by id.
    pub fn load_config(&self, id: &str) -> Result<Option<TenantConfig>> {
        self.get(id)?
            .map(|connection| self.decrypt_config(&connection))
            .transpose()
    }

    /// Connections created from an identical configuration.
    pub fn find_by_fingerprint(&self, fingerprint_hash: &str) -> Result<Vec<Connection>> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, server_id, encrypted_config, fingerprint_hash, created_at
                FROM connections WHERE fingerprint_hash = ?1 ORDER BY created_at
                "#,
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![fingerprint_hash], read_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter().map(parse_row).collect()
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.db.lock()?;
        conn.query_row("SELECT COUNT(*) FROM connections", [], |row| row.get(0))
            .context("Failed to count connections")
    }
}

type RawRow = (String, String, String, String, String);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn parse_row((id, server_id, encrypted_config, fingerprint_hash, created_at): RawRow) -> Result<Connection> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse created_at for connection {}", id))?;
    Ok(Connection {
        id,
        server_id,
        encrypted_config,
        fingerprint_hash,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::WriteMode;
    use crate::crypto::{CryptoError, MasterKeySource};

    fn create_test_store(secret: &str) -> (ConnectionStore, Database) {
        let db = Database::in_memory().expect("db");
        let source = MasterKeySource::new(Some(secret.to_string()), None);
        let encryption = EncryptionService::from_source(&source).expect("key");
        (ConnectionStore::new(db.clone(), encryption), db)
    }

    fn create_test_config() -> TenantConfig {
        let mut config = TenantConfig::new("pk_tenant_secret");
        config.workspace_id = Some("9001".to_string());
        config.write_mode = WriteMode::Selective;
        config.allowed_spaces.insert("S1".to_string());
        config
    }

    #[test]
    fn test_create_and_load() {
        let (store, _) = create_test_store("store-test");
        let config = create_test_config();

        let connection = store.create("taskbridge", &config).expect("create");
        assert_eq!(connection.server_id, "taskbridge");
        assert_eq!(connection.fingerprint_hash, config.fingerprint());

        let loaded = store.load_config(&connection.id).unwrap().unwrap();
        assert_eq!(loaded, config);

        let record = store.get(&connection.id).unwrap().unwrap();
        assert_eq!(record.id, connection.id);
    }

    #[test]
    fn test_plaintext_not_stored() {
        let (store, db) = create_test_store("store-test");
        let connection = store.create("taskbridge", &create_test_config()).unwrap();

        let conn = db.lock().unwrap();
        let raw: String = conn
            .query_row(
                "SELECT encrypted_config FROM connections WHERE id = ?1",
                params![connection.id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("pk_tenant_secret"));
        assert_eq!(raw.split(':').count(), 3);
    }

    #[test]
    fn test_get_nonexistent() {
        let (store, _) = create_test_store("store-test");
        assert!(store.get("missing").unwrap().is_none());
        assert!(store.load_config("missing").unwrap().is_none());
    }

    #[test]
    fn test_rotation_creates_new_record() {
        let (store, _) = create_test_store("store-test");
        let config = create_test_config();

        let first = store.create("taskbridge", &config).unwrap();
        let second = store.create("taskbridge", &config).unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.encrypted_config, second.encrypted_config);
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.find_by_fingerprint(&config.fingerprint()).unwrap().len(), 2);
    }

    #[test]
    fn test_key_rotation_orphans_connections() {
        let (store, db) = create_test_store("old-key");
        let connection = store.create("taskbridge", &create_test_config()).unwrap();

        let source = MasterKeySource::new(Some("new-key".to_string()), None);
        let rotated = ConnectionStore::new(db, EncryptionService::from_source(&source).unwrap());

        let err = rotated.load_config(&connection.id).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CryptoError>(),
            Some(&CryptoError::Authentication)
        );
    }
}
