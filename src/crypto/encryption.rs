//! AES-256-GCM sealing of tenant configuration.
//!
//! Every blob gets its own random nonce. The serialized form is three
//! colon-separated lowercase hex fields: `nonce:tag:ciphertext`.

use super::master_key::{KeyError, MasterKey, MasterKeySource};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits)
const TAG_SIZE: usize = 16;

/// Encryption errors
///
/// `Format` and `Authentication` are deliberately distinct: a blob that
/// parses but fails the tag check has been tampered with (or was sealed
/// under another key).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed encrypted blob: {0}")]
    Format(String),
    #[error("authentication failed (wrong key or tampered data)")]
    Authentication,
    #[error("encryption failed")]
    Encryption,
    #[error("decrypted data is not valid UTF-8")]
    Encoding,
}

/// Encrypts and decrypts serialized tenant configuration.
#[derive(Clone)]
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Builds the service from a key source.
    ///
    /// # Errors
    /// * `KeyError::MissingSecret` - No master key configured
    pub fn from_source(source: &MasterKeySource) -> Result<Self, KeyError> {
        source.key().map(Self::new)
    }

    /// Encrypts plaintext under a fresh random nonce.
    ///
    /// # Returns
    /// * `Ok(String)` - `nonce:tag:ciphertext`, hex encoded
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        // Generate random nonce (never reuse!)
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // aes-gcm appends the tag to the ciphertext
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypts a blob produced by [`EncryptionService::encrypt`].
    ///
    /// # Errors
    /// * `CryptoError::Format` - Not three hex fields, or wrong nonce/tag size
    /// * `CryptoError::Authentication` - Tag verification failed
    pub fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        let parts: Vec<&str> = blob.split(':').collect();
        if parts.len() != 3 {
            return Err(CryptoError::Format(format!(
                "expected 3 fields, got {}",
                parts.len()
            )));
        }

        let nonce = decode_field("nonce", parts[0])?;
        let tag = decode_field("tag", parts[1])?;
        let ciphertext = decode_field("ciphertext", parts[2])?;

        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::Format(format!(
                "invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::Format(format!(
                "invalid tag size: expected {}, got {}",
                TAG_SIZE,
                tag.len()
            )));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| CryptoError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Encoding)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(value).map_err(|e| CryptoError::Format(format!("{} is not hex: {}", name, e)))
}
