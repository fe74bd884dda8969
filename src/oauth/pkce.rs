//! PKCE S256 verification (RFC 7636).
//!
//! `challenge = BASE64URL-NOPAD(SHA256(ASCII(code_verifier)))`

use crate::crypto::secrets::constant_time_eq;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// The only supported challenge method.
pub const S256: &str = "S256";

/// Computes the S256 challenge for a verifier.
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// True when `S256(verifier)` equals `challenge`.
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    constant_time_eq(&s256_challenge(verifier), challenge)
}

/// Shape check for a challenge received at the authorization endpoint:
/// 43-128 characters of the base64url alphabet.
pub fn is_well_formed_challenge(challenge: &str) -> bool {
    (43..=128).contains(&challenge.len())
        && challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
