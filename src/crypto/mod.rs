//! Encryption of tenant configuration at rest.
//!
//! Tenant configurations (upstream API keys, workspace ids, write policy) are
//! serialized to JSON and sealed with AES-256-GCM before they reach SQLite.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       MasterKeySource                    │
//! │  - TASKBRIDGE_MASTER_KEY (primary)       │
//! │  - TASKBRIDGE_ENCRYPTION_KEY (fallback)  │
//! │  - hex or passphrase → 32 bytes          │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       EncryptionService                  │
//! │  - AES-256-GCM                           │
//! │  - fresh 96-bit nonce per blob           │
//! │  - "nonce:tag:ciphertext" (hex)          │
//! └─────────────────────────────────────────┘
//!          ↓
//!    ConnectionStore (SQLite)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use taskbridge::crypto::{EncryptionService, MasterKeySource};
//!
//! # fn main() -> anyhow::Result<()> {
//! let source = MasterKeySource::from_env();
//! let service = EncryptionService::from_source(&source)?;
//!
//! let blob = service.encrypt(r#"{"api_key":"pk_123"}"#)?;
//! assert_eq!(service.decrypt(&blob)?, r#"{"api_key":"pk_123"}"#);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - There is exactly one key. Changing it orphans every stored connection.
//! - The derived key is never persisted and never printed (`Debug` is redacted)
//! - Tampering with any field of a blob fails authentication

mod encryption;
mod master_key;
pub mod secrets;

pub use encryption::{CryptoError, EncryptionService};
pub use master_key::{KeyError, KeyFormat, KeyInfo, MasterKey, MasterKeySource};
