//! Pending authorization requests, bound to a CSRF token.
//!
//! GET /authorize records the validated request parameters under a random
//! token that is both set as an HttpOnly cookie and embedded in the form.
//! POST /authorize must present the same token in cookie and body, and the
//! submitted parameters must match what was recorded. Entries are single-use
//! and expire.

use crate::crypto::secrets::random_hex;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Authorization request parameters recorded at GET /authorize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub created_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn new(
        client_id: &str,
        redirect_uri: &str,
        state: Option<&str>,
        code_challenge: &str,
        code_challenge_method: &str,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            state: state.map(str::to_string),
            code_challenge: code_challenge.to_string(),
            code_challenge_method: code_challenge_method.to_string(),
            created_at: Utc::now(),
        }
    }

    /// True when a submission carries the same client, redirect and challenge.
    pub fn matches(&self, client_id: &str, redirect_uri: &str, code_challenge: &str) -> bool {
        self.client_id == client_id
            && self.redirect_uri == redirect_uri
            && self.code_challenge == code_challenge
    }
}

/// CSRF-token keyed store of pending authorizations with expiry.
#[derive(Clone)]
pub struct PendingAuthorizations {
    entries: Arc<DashMap<String, PendingAuthorization>>,
    expiry_duration: Duration,
}

impl PendingAuthorizations {
    /// # Arguments
    /// * `expiry` - How long a rendered form stays valid (default: 10 minutes)
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            expiry_duration: expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry_duration
    }

    /// Stores the request and returns its CSRF token (256 bits, hex).
    pub fn create(&self, pending: PendingAuthorization) -> String {
        let token = random_hex(32);
        self.entries.insert(token.clone(), pending);
        token
    }

    /// Removes and returns the entry if present and not expired.
    pub fn validate_and_consume(&self, token: &str) -> Option<PendingAuthorization> {
        let (_, entry) = self.entries.remove(token)?;

        if Utc::now() - entry.created_at > self.expiry_duration {
            return None;
        }

        Some(entry)
    }

    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        self.entries
            .retain(|_, entry| now - entry.created_at <= self.expiry_duration);
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Background task to periodically drop expired pending authorizations
pub async fn run_pending_cleanup(pending: PendingAuthorizations, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        pending.cleanup_expired();
        tracing::debug!(remaining = pending.count(), "Pending authorization cleanup complete");
    }
}
