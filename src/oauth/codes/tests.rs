use super::*;
use crate::connections::{ConnectionStore, TenantConfig};
use crate::crypto::{EncryptionService, MasterKeySource};
use crate::oauth::pkce::s256_challenge;
use std::sync::Arc;

const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const REDIRECT: &str = "https://app.example/cb";

struct Fixture {
    codes: AuthorizationCodeService,
    tokens: TokenService,
    connection_id: String,
}

fn fixture(ttl: Duration) -> Fixture {
    let db = Database::in_memory().unwrap();
    let source = MasterKeySource::new(Some("code-tests".to_string()), None);
    let connections = ConnectionStore::new(db.clone(), EncryptionService::from_source(&source).unwrap());
    let connection = connections.create("srv", &TenantConfig::new("pk_1")).unwrap();
    let tokens = TokenService::new(db.clone(), connections, Duration::hours(1));
    Fixture {
        codes: AuthorizationCodeService::new(db, tokens.clone(), ttl),
        tokens,
        connection_id: connection.id,
    }
}

fn full_binding(connection_id: &str) -> CodeBinding {
    CodeBinding {
        connection_id: connection_id.to_string(),
        client_id: Some("client1".to_string()),
        redirect_uri: Some(REDIRECT.to_string()),
        code_challenge: Some(s256_challenge(VERIFIER)),
        code_challenge_method: Some("S256".to_string()),
    }
}

fn exchange(code: &str) -> CodeExchange {
    CodeExchange {
        code: code.to_string(),
        redirect_uri: Some(REDIRECT.to_string()),
        code_verifier: Some(VERIFIER.to_string()),
        client_id: Some("client1".to_string()),
    }
}

#[test]
fn test_code_shape() {
    let f = fixture(Duration::minutes(10));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();
    // 256 bits of entropy, hex encoded
    assert_eq!(code.len(), 64);
}

#[test]
fn test_exchange_success_issues_token() {
    let f = fixture(Duration::minutes(10));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();

    let issued = f.codes.exchange_code(&exchange(&code)).unwrap();
    assert_eq!(issued.connection_id, f.connection_id);

    let resolved = f.tokens.resolve(&issued.token).unwrap().unwrap();
    assert_eq!(resolved.connection_id, f.connection_id);
}

#[test]
fn test_code_is_single_use() {
    let f = fixture(Duration::minutes(10));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();

    assert!(f.codes.exchange_code(&exchange(&code)).is_ok());
    assert!(matches!(
        f.codes.exchange_code(&exchange(&code)),
        Err(CodeError::InvalidCode)
    ));
}

#[test]
fn test_unknown_code() {
    let f = fixture(Duration::minutes(10));
    assert!(matches!(
        f.codes.exchange_code(&exchange("deadbeef")),
        Err(CodeError::InvalidCode)
    ));
}

#[test]
fn test_expired_then_not_found() {
    let f = fixture(Duration::seconds(-1));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();

    assert!(matches!(
        f.codes.exchange_code(&exchange(&code)),
        Err(CodeError::CodeExpired)
    ));
    assert!(matches!(
        f.codes.exchange_code(&exchange(&code)),
        Err(CodeError::InvalidCode)
    ));
}

#[test]
fn test_purge_expired() {
    let f = fixture(Duration::seconds(-1));
    f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();
    f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();
    assert_eq!(f.codes.purge_expired().unwrap(), 2);
    assert_eq!(f.codes.purge_expired().unwrap(), 0);
}

#[test]
fn test_pkce_wrong_verifier() {
    let f = fixture(Duration::minutes(10));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();

    let mut attempt = exchange(&code);
    attempt.code_verifier = Some("a-completely-different-verifier-value-000000".to_string());
    assert!(matches!(
        f.codes.exchange_code(&attempt),
        Err(CodeError::PkceFailure(_))
    ));

    // Terminal failure consumed the code
    assert!(matches!(
        f.codes.exchange_code(&exchange(&code)),
        Err(CodeError::InvalidCode)
    ));
}

#[test]
fn test_pkce_missing_verifier() {
    let f = fixture(Duration::minutes(10));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();

    let mut attempt = exchange(&code);
    attempt.code_verifier = None;
    assert!(matches!(
        f.codes.exchange_code(&attempt),
        Err(CodeError::PkceFailure(_))
    ));
}

#[test]
fn test_pkce_plain_method_rejected() {
    let f = fixture(Duration::minutes(10));
    let mut binding = full_binding(&f.connection_id);
    binding.code_challenge = Some(VERIFIER.to_string());
    binding.code_challenge_method = Some("plain".to_string());
    let code = f.codes.generate_code(&binding).unwrap();

    assert!(matches!(
        f.codes.exchange_code(&exchange(&code)),
        Err(CodeError::PkceFailure(_))
    ));
}

#[test]
fn test_redirect_binding() {
    let f = fixture(Duration::minutes(10));

    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();
    let mut attempt = exchange(&code);
    attempt.redirect_uri = Some("https://app.example/cb/".to_string());
    assert!(matches!(
        f.codes.exchange_code(&attempt),
        Err(CodeError::RedirectMismatch)
    ));

    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();
    let mut attempt = exchange(&code);
    attempt.redirect_uri = None;
    assert!(matches!(
        f.codes.exchange_code(&attempt),
        Err(CodeError::RedirectMismatch)
    ));
}

#[test]
fn test_unbound_redirect_accepts_any() {
    let f = fixture(Duration::minutes(10));
    let mut binding = full_binding(&f.connection_id);
    binding.redirect_uri = None;

    let code = f.codes.generate_code(&binding).unwrap();
    let mut attempt = exchange(&code);
    attempt.redirect_uri = Some("https://anywhere.example/else".to_string());
    assert!(f.codes.exchange_code(&attempt).is_ok());

    let code = f.codes.generate_code(&binding).unwrap();
    let mut attempt = exchange(&code);
    attempt.redirect_uri = None;
    assert!(f.codes.exchange_code(&attempt).is_ok());
}

#[test]
fn test_client_binding() {
    let f = fixture(Duration::minutes(10));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();

    let mut attempt = exchange(&code);
    attempt.client_id = Some("client2".to_string());
    assert!(matches!(
        f.codes.exchange_code(&attempt),
        Err(CodeError::ClientMismatch)
    ));
}

#[test]
fn test_no_pkce_bound() {
    let f = fixture(Duration::minutes(10));
    let binding = CodeBinding {
        connection_id: f.connection_id.clone(),
        ..Default::default()
    };
    let code = f.codes.generate_code(&binding).unwrap();
    let attempt = CodeExchange {
        code,
        ..Default::default()
    };
    assert!(f.codes.exchange_code(&attempt).is_ok());
}

#[test]
fn test_concurrent_exchange_single_winner() {
    let f = fixture(Duration::minutes(10));
    let code = f.codes.generate_code(&full_binding(&f.connection_id)).unwrap();
    let codes = Arc::new(f.codes);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let codes = Arc::clone(&codes);
            let attempt = exchange(&code);
            std::thread::spawn(move || codes.exchange_code(&attempt).is_ok())
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);
}
