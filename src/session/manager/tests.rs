use super::*;
use crate::connections::{ConnectionStore, RawTenantParams, WriteMode};
use crate::crypto::{EncryptionService, MasterKeySource};
use crate::oauth::TokenService;
use crate::session::{Engine, ProtocolEngineFactory, ResolvedSession};
use crate::store::Database;
use crate::upstream::fake::FakeTaskApi;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Validator backed by a table of tokens that tests can revoke from.
#[derive(Default)]
struct StaticValidator {
    tokens: Mutex<HashMap<String, ResolvedSession>>,
}

impl StaticValidator {
    fn with(self, token: &str, session_id: &str) -> Self {
        self.tokens.lock().unwrap().insert(
            token.to_string(),
            ResolvedSession {
                session_id: session_id.to_string(),
                connection_id: Some(format!("conn-{}", session_id)),
                config: TenantConfig::new(format!("pk-for-{}", token)),
            },
        );
        self
    }

    fn revoke(&self, token: &str) {
        self.tokens.lock().unwrap().remove(token);
    }
}

#[async_trait]
impl SessionTokenValidator for StaticValidator {
    async fn validate(&self, token: &str) -> Result<Option<ResolvedSession>> {
        Ok(self.tokens.lock().unwrap().get(token).cloned())
    }
}

/// Keeps every engine it builds so tests can inspect discarded ones.
struct RecordingFactory {
    inner: ProtocolEngineFactory,
    built: Mutex<Vec<Arc<dyn Engine>>>,
}

impl RecordingFactory {
    fn new() -> Self {
        Self {
            inner: ProtocolEngineFactory::new(Arc::new(FakeTaskApi::default())),
            built: Mutex::new(Vec::new()),
        }
    }

    fn built(&self) -> Vec<Arc<dyn Engine>> {
        self.built.lock().unwrap().clone()
    }
}

impl EngineFactory for RecordingFactory {
    fn build(&self, session_id: &str, config: Arc<TenantConfig>) -> Arc<dyn Engine> {
        let engine = self.inner.build(session_id, config);
        self.built.lock().unwrap().push(Arc::clone(&engine));
        engine
    }
}

fn manager_with(validator: StaticValidator, api: FakeTaskApi) -> (SessionManager, Arc<RecordingFactory>) {
    let factory = Arc::new(RecordingFactory::new());
    let manager = SessionManager::new(Arc::new(validator), factory.clone(), Arc::new(api));
    (manager, factory)
}

fn raw_request(api_key: &str) -> SessionRequest {
    let mut req = request(None, Some(SessionCredential::api_key(api_key)));
    req.tenant.workspace_id = Some("W1".to_string());
    req
}

fn request(session_id: Option<&str>, credential: Option<SessionCredential>) -> SessionRequest {
    SessionRequest {
        session_id: session_id.map(str::to_string),
        credential,
        tenant: RawTenantParams::default(),
    }
}

#[tokio::test]
async fn test_bearer_resolves_to_stored_session() {
    let (manager, _) = manager_with(StaticValidator::default().with("tok-a", "sess-a"), FakeTaskApi::default());

    let session = manager
        .resolve(request(None, Some(SessionCredential::bearer("tok-a"))))
        .await
        .unwrap();
    assert_eq!(session.session_id, "sess-a");
    assert_eq!(session.connection_id.as_deref(), Some("conn-sess-a"));
    assert_eq!(session.config.api_key, "pk-for-tok-a");
    assert_eq!(manager.count(), 1);

    // Same token again reuses the live session
    let again = manager
        .resolve(request(None, Some(SessionCredential::bearer("tok-a"))))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&session, &again));
}

#[tokio::test]
async fn test_unresolved_bearer_is_rejected() {
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default().with_workspace("W1"));
    let result = manager
        .resolve(request(None, Some(SessionCredential::bearer("pk_raw_key"))))
        .await;
    assert!(matches!(result, Err(SessionError::InvalidSessionToken)));
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn test_credential_required_without_session_id() {
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default());
    let result = manager.resolve(request(None, None)).await;
    assert!(matches!(result, Err(SessionError::AuthenticationRequired)));
}

#[tokio::test]
async fn test_unknown_session_id() {
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default());
    let result = manager
        .resolve(request(Some("nope"), Some(SessionCredential::bearer("tok"))))
        .await;
    assert!(matches!(result, Err(SessionError::SessionNotFound)));
}

#[tokio::test]
async fn test_session_pinning() {
    let validator = StaticValidator::default()
        .with("tok-a", "sess-a")
        .with("tok-b", "sess-b");
    let (manager, factory) = manager_with(validator, FakeTaskApi::default());

    let session = manager
        .resolve(request(None, Some(SessionCredential::bearer("tok-a"))))
        .await
        .unwrap();

    // No credential inherits the bound one
    let inherited = manager.resolve(request(Some("sess-a"), None)).await.unwrap();
    assert!(Arc::ptr_eq(&session, &inherited));
    assert_eq!(inherited.credential.token, "tok-a");

    // Same credential is accepted
    let same = manager
        .resolve(request(Some("sess-a"), Some(SessionCredential::bearer("tok-a"))))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&session, &same));

    // A different credential is rejected and the session torn down
    let result = manager
        .resolve(request(Some("sess-a"), Some(SessionCredential::bearer("tok-b"))))
        .await;
    assert!(matches!(result, Err(SessionError::CredentialMismatch)));
    assert_eq!(manager.count(), 0);
    assert!(factory.built()[0].is_closed());

    let result = manager.resolve(request(Some("sess-a"), None)).await;
    assert!(matches!(result, Err(SessionError::SessionNotFound)));
}

#[tokio::test]
async fn test_raw_api_key_creates_session_and_resolves_workspace() {
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default().with_workspace("W42"));

    let mut req = request(None, Some(SessionCredential::api_key("pk_raw")));
    req.tenant.write_mode = Some("read".to_string());
    let session = manager.resolve(req).await.unwrap();

    assert_eq!(session.config.api_key, "pk_raw");
    assert_eq!(session.config.workspace_id.as_deref(), Some("W42"));
    assert_eq!(session.config.write_mode, WriteMode::Read);
    assert!(session.connection_id.is_none());
    assert!(Uuid::parse_str(&session.session_id).is_ok());
}

#[tokio::test]
async fn test_raw_api_key_keeps_supplied_workspace() {
    // No workspace available upstream: the supplied one must be used as is
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default());

    let mut req = request(None, Some(SessionCredential::api_key("pk_raw")));
    req.tenant.workspace_id = Some("W7".to_string());
    let session = manager.resolve(req).await.unwrap();
    assert_eq!(session.config.workspace_id.as_deref(), Some("W7"));
}

#[tokio::test]
async fn test_raw_api_key_errors() {
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default());

    let result = manager
        .resolve(request(None, Some(SessionCredential::api_key("pk_raw"))))
        .await;
    assert!(matches!(result, Err(SessionError::WorkspaceUnresolved(_))));

    let mut req = request(None, Some(SessionCredential::api_key("pk_raw")));
    req.tenant.workspace_id = Some("W1".to_string());
    req.tenant.write_mode = Some("selective".to_string());
    let result = manager.resolve(req).await;
    assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn test_losing_creator_engine_is_shut_down() {
    let (manager, factory) = manager_with(StaticValidator::default(), FakeTaskApi::default());

    let first = manager
        .install("sess-x".to_string(), SessionCredential::api_key("k"), TenantConfig::new("k"), None)
        .await
        .unwrap();
    let second = manager
        .install("sess-x".to_string(), SessionCredential::api_key("k"), TenantConfig::new("k"), None)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.count(), 1);
    let built = factory.built();
    assert_eq!(built.len(), 2);
    assert!(!built[0].is_closed());
    assert!(built[1].is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_yields_one_live_engine() {
    let (manager, factory) = manager_with(StaticValidator::default().with("tok", "sess-1"), FakeTaskApi::default());
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .resolve(request(None, Some(SessionCredential::bearer("tok"))))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap());
    }

    assert_eq!(manager.count(), 1);
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    let live = factory.built().iter().filter(|e| !e.is_closed()).count();
    assert_eq!(live, 1);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (manager, factory) = manager_with(StaticValidator::default().with("tok", "sess-1"), FakeTaskApi::default());
    manager
        .resolve(request(None, Some(SessionCredential::bearer("tok"))))
        .await
        .unwrap();

    assert!(manager.close("sess-1").await);
    assert!(!manager.close("sess-1").await);
    assert!(factory.built()[0].is_closed());
    assert!(manager.get("sess-1").is_none());
}

#[tokio::test]
async fn test_close_all() {
    let validator = StaticValidator::default()
        .with("tok-a", "sess-a")
        .with("tok-b", "sess-b");
    let (manager, _) = manager_with(validator, FakeTaskApi::default());
    for token in ["tok-a", "tok-b"] {
        manager
            .resolve(request(None, Some(SessionCredential::bearer(token))))
            .await
            .unwrap();
    }
    assert_eq!(manager.close_all().await, 2);
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn test_revoked_credential_closes_session_on_resume() {
    let validator = Arc::new(StaticValidator::default().with("tok-a", "sess-a"));
    let factory = Arc::new(RecordingFactory::new());
    let manager = SessionManager::new(validator.clone(), factory.clone(), Arc::new(FakeTaskApi::default()));

    manager
        .resolve(request(None, Some(SessionCredential::bearer("tok-a"))))
        .await
        .unwrap();
    assert!(manager.resolve(request(Some("sess-a"), None)).await.is_ok());

    validator.revoke("tok-a");

    let result = manager
        .resolve(request(Some("sess-a"), Some(SessionCredential::bearer("tok-a"))))
        .await;
    assert!(matches!(result, Err(SessionError::InvalidSessionToken)));
    assert_eq!(manager.count(), 0);
    assert!(factory.built()[0].is_closed());

    let result = manager.resolve(request(Some("sess-a"), None)).await;
    assert!(matches!(result, Err(SessionError::SessionNotFound)));
}

#[tokio::test]
async fn test_raw_sessions_skip_revalidation() {
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default());
    let session = manager.resolve(raw_request("pk_raw")).await.unwrap();

    let resumed = manager
        .resolve(request(Some(&session.session_id), None))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&session, &resumed));
}

#[tokio::test]
async fn test_session_cap_refuses_new_sessions() {
    let (manager, _) = manager_with(StaticValidator::default(), FakeTaskApi::default());
    let manager = manager.with_limits(SessionLimits {
        max_sessions: 2,
        idle_timeout: Duration::from_secs(3600),
    });

    let first = manager.resolve(raw_request("pk_1")).await.unwrap();
    manager.resolve(raw_request("pk_2")).await.unwrap();

    let result = manager.resolve(raw_request("pk_3")).await;
    assert!(matches!(result, Err(SessionError::CapacityExceeded)));
    assert_eq!(manager.count(), 2);

    // Live sessions keep working at the cap
    assert!(manager
        .resolve(request(Some(&first.session_id), None))
        .await
        .is_ok());

    manager.close(&first.session_id).await;
    assert!(manager.resolve(raw_request("pk_3")).await.is_ok());
}

#[tokio::test]
async fn test_full_manager_evicts_idle_sessions_first() {
    let (manager, factory) = manager_with(StaticValidator::default(), FakeTaskApi::default());
    let manager = manager.with_limits(SessionLimits {
        max_sessions: 1,
        idle_timeout: Duration::from_secs(60),
    });

    let stale = manager.resolve(raw_request("pk_1")).await.unwrap();
    stale.backdate(120_000);

    let fresh = manager.resolve(raw_request("pk_2")).await.unwrap();
    assert_eq!(manager.count(), 1);
    assert!(manager.get(&stale.session_id).is_none());
    assert!(manager.get(&fresh.session_id).is_some());
    assert!(factory.built()[0].is_closed());
}

#[tokio::test]
async fn test_close_idle() {
    let (manager, factory) = manager_with(StaticValidator::default(), FakeTaskApi::default());
    let manager = manager.with_limits(SessionLimits {
        max_sessions: 10,
        idle_timeout: Duration::from_secs(60),
    });

    let idle = manager.resolve(raw_request("pk_1")).await.unwrap();
    let active = manager.resolve(raw_request("pk_2")).await.unwrap();
    idle.backdate(61_000);
    active.backdate(61_000);

    // A request refreshes the last-used time
    manager
        .resolve(request(Some(&active.session_id), None))
        .await
        .unwrap();

    assert_eq!(manager.close_idle().await, 1);
    assert!(manager.get(&idle.session_id).is_none());
    assert!(manager.get(&active.session_id).is_some());
    assert!(factory.built()[0].is_closed());
    assert!(!factory.built()[1].is_closed());

    assert_eq!(manager.close_idle().await, 0);
}

#[tokio::test]
async fn test_token_service_as_validator() {
    let db = Database::in_memory().unwrap();
    let source = MasterKeySource::new(Some("session-tests".to_string()), None);
    let connections = ConnectionStore::new(db.clone(), EncryptionService::from_source(&source).unwrap());
    let tokens = TokenService::new(db, connections.clone(), chrono::Duration::hours(1));

    let mut config = TenantConfig::new("pk_stored");
    config.workspace_id = Some("W1".to_string());
    let connection = connections.create("srv", &config).unwrap();
    let issued = tokens.issue_api_key(&connection.id).unwrap();

    let factory = Arc::new(RecordingFactory::new());
    let manager = SessionManager::new(Arc::new(tokens), factory, Arc::new(FakeTaskApi::default()));

    // Issued API keys arrive through the api-key headers, not as bearer tokens
    let session = manager
        .resolve(request(None, Some(SessionCredential::api_key(issued.token.clone()))))
        .await
        .unwrap();
    assert_eq!(session.session_id, issued.session_id);
    assert_eq!(session.connection_id.as_deref(), Some(connection.id.as_str()));
    assert_eq!(session.config.api_key, "pk_stored");
}

#[tokio::test]
async fn test_revoked_api_key_ends_session() {
    let db = Database::in_memory().unwrap();
    let source = MasterKeySource::new(Some("session-tests".to_string()), None);
    let connections = ConnectionStore::new(db.clone(), EncryptionService::from_source(&source).unwrap());
    let tokens = TokenService::new(db, connections.clone(), chrono::Duration::hours(1));

    let mut config = TenantConfig::new("pk_stored");
    config.workspace_id = Some("W1".to_string());
    let connection = connections.create("srv", &config).unwrap();
    let issued = tokens.issue_api_key(&connection.id).unwrap();

    let factory = Arc::new(RecordingFactory::new());
    let manager = SessionManager::new(Arc::new(tokens.clone()), factory, Arc::new(FakeTaskApi::default()));

    let session = manager
        .resolve(request(None, Some(SessionCredential::api_key(issued.token.clone()))))
        .await
        .unwrap();

    tokens.revoke(&issued.token).unwrap();

    let result = manager.resolve(request(Some(&session.session_id), None)).await;
    assert!(matches!(result, Err(SessionError::InvalidSessionToken)));
    assert_eq!(manager.count(), 0);
}
