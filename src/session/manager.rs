//! Session manager: owns the live session map.

use super::{
    EngineFactory, Provenance, Session, SessionCredential, SessionError, SessionRequest,
    SessionTokenValidator,
};
use crate::connections::TenantConfig;
use crate::upstream::TaskApi;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounds on the live session set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

/// Routes protocol requests to live sessions.
///
/// # Lifecycle
/// - Created on the first authenticated request without a session id
/// - Reused while requests carry the session id (and, optionally, the same credential)
/// - Torn down on explicit close, when a different credential is presented,
///   when a stored credential stops validating, or after sitting idle
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    validator: Arc<dyn SessionTokenValidator>,
    engines: Arc<dyn EngineFactory>,
    api: Arc<dyn TaskApi>,
    limits: SessionLimits,
}

impl SessionManager {
    pub fn new(
        validator: Arc<dyn SessionTokenValidator>,
        engines: Arc<dyn EngineFactory>,
        api: Arc<dyn TaskApi>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            validator,
            engines,
            api,
            limits: SessionLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Finds or creates the session a request belongs to.
    pub async fn resolve(&self, request: SessionRequest) -> Result<Arc<Session>, SessionError> {
        let session = self.route(request).await?;
        session.touch();
        Ok(session)
    }

    async fn route(&self, request: SessionRequest) -> Result<Arc<Session>, SessionError> {
        if let Some(session_id) = request.session_id.as_deref() {
            return self.resume(session_id, request.credential).await;
        }

        let credential = request
            .credential
            .ok_or(SessionError::AuthenticationRequired)?;

        if let Some(resolved) = self.validator.validate(&credential.token).await? {
            if let Some(existing) = self.get(&resolved.session_id) {
                return self.pin(existing, Some(credential)).await;
            }
            return self
                .install(
                    resolved.session_id,
                    credential,
                    resolved.config,
                    resolved.connection_id,
                )
                .await;
        }

        if credential.provenance == Provenance::Bearer {
            warn!("Rejected bearer token that does not resolve to a stored connection");
            return Err(SessionError::InvalidSessionToken);
        }

        let mut config = TenantConfig::from_raw(&credential.token, &request.tenant)?;
        if config.workspace_id.is_none() {
            let workspace_id = self
                .api
                .default_workspace(&config.api_key)
                .await
                .map_err(|e| SessionError::WorkspaceUnresolved(e.to_string()))?;
            debug!(workspace_id = %workspace_id, "Resolved workspace for raw api key");
            config.workspace_id = Some(workspace_id);
        }

        self.install(Uuid::new_v4().to_string(), credential, config, None)
            .await
    }

    async fn resume(
        &self,
        session_id: &str,
        credential: Option<SessionCredential>,
    ) -> Result<Arc<Session>, SessionError> {
        let session = self.get(session_id).ok_or_else(|| {
            debug!(session_id = %session_id, "Unknown session id");
            SessionError::SessionNotFound
        })?;
        let session = self.pin(session, credential).await?;

        // Issued credentials can be revoked or expire while the session lives
        if session.connection_id.is_some() {
            let still_valid = self
                .validator
                .validate(&session.credential.token)
                .await?
                .is_some_and(|resolved| resolved.session_id == session.session_id);
            if !still_valid {
                warn!(session_id = %session.session_id, "Session credential no longer valid, closing session");
                self.close(&session.session_id).await;
                return Err(SessionError::InvalidSessionToken);
            }
        }
        Ok(session)
    }

    /// A session keeps the credential it was created with. No credential
    /// inherits it; a different one tears the session down.
    async fn pin(
        &self,
        session: Arc<Session>,
        credential: Option<SessionCredential>,
    ) -> Result<Arc<Session>, SessionError> {
        match credential {
            None => Ok(session),
            Some(credential) if session.credential.matches(&credential) => Ok(session),
            Some(_) => {
                warn!(session_id = %session.session_id, "Credential mismatch, closing session");
                self.close(&session.session_id).await;
                Err(SessionError::CredentialMismatch)
            }
        }
    }

    /// Installs a new session unless one already exists under the id, in
    /// which case the freshly built engine is discarded and the existing
    /// session is returned.
    ///
    /// At capacity, idle sessions are swept first; if none were idle the new
    /// session is refused. Concurrent creators may overshoot the cap by the
    /// number of racing requests.
    async fn install(
        &self,
        session_id: String,
        credential: SessionCredential,
        config: TenantConfig,
        connection_id: Option<String>,
    ) -> Result<Arc<Session>, SessionError> {
        if !self.sessions.contains_key(&session_id)
            && self.sessions.len() >= self.limits.max_sessions
        {
            self.close_idle().await;
            if self.sessions.len() >= self.limits.max_sessions {
                warn!(
                    live = self.sessions.len(),
                    max_sessions = self.limits.max_sessions,
                    "Session limit reached, refusing new session"
                );
                return Err(SessionError::CapacityExceeded);
            }
        }

        let config = Arc::new(config);
        let engine = self.engines.build(&session_id, Arc::clone(&config));
        let candidate = Arc::new(Session::new(
            session_id.clone(),
            credential,
            config,
            connection_id,
            engine,
        ));

        let (session, loser) = match self.sessions.entry(session_id) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), Some(candidate)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&candidate));
                (candidate, None)
            }
        };

        match loser {
            Some(loser) => {
                debug!(session_id = %loser.session_id, "Lost session creation race, discarding engine");
                loser.engine().shutdown().await;
            }
            None => info!(
                session_id = %session.session_id,
                connection_id = ?session.connection_id,
                write_mode = %session.config.write_mode,
                "Session created"
            ),
        }

        Ok(session)
    }

    /// Removes a session and shuts its engine down. Returns false if there
    /// was nothing to remove.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        session.engine().shutdown().await;
        info!(session_id = %session_id, "Session closed");
        true
    }

    /// Closes every live session.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if self.close(&id).await {
                closed += 1;
            }
        }
        closed
    }

    /// Closes sessions that have not seen a request within the idle timeout.
    pub async fn close_idle(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let timeout = i64::try_from(self.limits.idle_timeout.as_millis()).unwrap_or(i64::MAX);
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_millis(now) >= timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for id in idle {
            if self.close(&id).await {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed = closed, "Closed idle sessions");
        }
        closed
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests;
