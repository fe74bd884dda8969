//! Process-wide master key derivation.
//!
//! The configured secret is either 64 hex characters (used verbatim as 32
//! raw bytes) or an arbitrary passphrase (hashed with SHA-256 to 32 bytes).

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::warn;

/// Size of the derived key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Primary environment variable holding the master secret.
pub const PRIMARY_ENV: &str = "TASKBRIDGE_MASTER_KEY";

/// Legacy environment variable, consulted only when the primary is unset.
pub const FALLBACK_ENV: &str = "TASKBRIDGE_ENCRYPTION_KEY";

/// Master key errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// Neither the primary nor the fallback source holds a non-empty secret
    #[error("no master key configured (set TASKBRIDGE_MASTER_KEY)")]
    MissingSecret,
}

/// A derived 32-byte key. Never printed.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// How the configured secret was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    Hex,
    Passphrase,
}

/// Non-sensitive diagnostics about the master key.
///
/// `checksum` is taken over the derived key, not the source secret, so
/// operators can confirm a rotation without exposing key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub configured: bool,
    pub using_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<KeyFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Derives and caches the master key.
///
/// Owned by the application and passed to whatever needs it. The
/// "fallback used" warning is tracked per source, not in a static.
pub struct MasterKeySource {
    primary: Option<String>,
    fallback: Option<String>,
    fallback_warned: AtomicBool,
    derived: OnceLock<MasterKey>,
}

impl MasterKeySource {
    /// Builds a source from explicit values. Trimmed-empty values count as unset.
    pub fn new(primary: Option<String>, fallback: Option<String>) -> Self {
        Self {
            primary: normalize(primary),
            fallback: normalize(fallback),
            fallback_warned: AtomicBool::new(false),
            derived: OnceLock::new(),
        }
    }

    /// Reads `TASKBRIDGE_MASTER_KEY`, falling back to `TASKBRIDGE_ENCRYPTION_KEY`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var(PRIMARY_ENV).ok(),
            std::env::var(FALLBACK_ENV).ok(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.primary.is_some() || self.fallback.is_some()
    }

    fn selected(&self) -> Option<(&str, bool)> {
        match (&self.primary, &self.fallback) {
            (Some(primary), _) => Some((primary.as_str(), false)),
            (None, Some(fallback)) => Some((fallback.as_str(), true)),
            (None, None) => None,
        }
    }

    /// Returns the derived key, deriving it on first call.
    ///
    /// # Errors
    /// * `KeyError::MissingSecret` - No usable secret in either source
    pub fn key(&self) -> Result<&MasterKey, KeyError> {
        if let Some(key) = self.derived.get() {
            return Ok(key);
        }

        let (secret, from_fallback) = self.selected().ok_or(KeyError::MissingSecret)?;

        if from_fallback && !self.fallback_warned.swap(true, Ordering::SeqCst) {
            warn!(
                fallback = FALLBACK_ENV,
                primary = PRIMARY_ENV,
                "Master key loaded from fallback variable; move it to the primary variable"
            );
        }

        Ok(self.derived.get_or_init(|| derive_key(secret)))
    }

    /// Raw key bytes.
    pub fn bytes(&self) -> Result<[u8; KEY_SIZE], KeyError> {
        self.key().map(|key| *key.as_bytes())
    }

    /// Diagnostics safe to expose on a status endpoint.
    pub fn info(&self) -> KeyInfo {
        let Some((secret, using_fallback)) = self.selected() else {
            return KeyInfo {
                configured: false,
                using_fallback: false,
                format: None,
                checksum: None,
            };
        };

        let checksum = self.key().ok().map(|key| {
            let digest = hex::encode(Sha256::digest(key.as_bytes()));
            digest[..8].to_string()
        });

        KeyInfo {
            configured: true,
            using_fallback,
            format: Some(detect_format(secret)),
            checksum,
        }
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn detect_format(secret: &str) -> KeyFormat {
    if secret.len() == KEY_SIZE * 2 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
        KeyFormat::Hex
    } else {
        KeyFormat::Passphrase
    }
}

fn derive_key(secret: &str) -> MasterKey {
    let mut bytes = [0u8; KEY_SIZE];
    match detect_format(secret) {
        KeyFormat::Hex => {
            // 64 hex digits always decode to exactly 32 bytes
            if hex::decode_to_slice(secret, &mut bytes).is_err() {
                bytes.copy_from_slice(&Sha256::digest(secret.as_bytes()));
            }
        }
        KeyFormat::Passphrase => bytes.copy_from_slice(&Sha256::digest(secret.as_bytes())),
    }
    MasterKey(bytes)
}
