// Rate limiting for the OAuth endpoints.
//
// One token bucket per (endpoint, caller). The caller is the peer address,
// or the first X-Forwarded-For hop when the server sits behind a trusted
// proxy.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Token bucket for a single (endpoint, caller) key.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Refills based on elapsed time at rate = capacity/60 tokens/sec.
    fn try_consume(&mut self, capacity: u64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill_rate = capacity as f64 / 60.0;
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-endpoint, per-caller token bucket rate limiter.
///
/// Buckets are created lazily on first request. State is in-memory only (resets on restart).
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and consume one token for `caller` on `endpoint` at `limit_per_minute`.
    ///
    /// Returns true if the request is allowed, false if rate limit exceeded.
    pub fn check_and_consume(&self, endpoint: &str, caller: &str, limit_per_minute: u64) -> bool {
        let mut bucket = self
            .buckets
            .entry(format!("{}:{}", endpoint, caller))
            .or_insert_with(|| TokenBucket::new(limit_per_minute));
        bucket.try_consume(limit_per_minute)
    }

    /// Drops buckets untouched for `max_idle`. Returns the number removed.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_refill.elapsed() < max_idle);
        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Middleware state for one rate-limited endpoint.
#[derive(Clone)]
pub struct RateLimitPolicy {
    pub limiter: Arc<RateLimiter>,
    pub endpoint: &'static str,
    pub limit_per_minute: u64,
    pub trust_forwarded_for: bool,
}

/// Rejects the request with 429 when the caller's bucket is empty.
pub async fn enforce_rate_limit(
    State(policy): State<RateLimitPolicy>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_key(&request, policy.trust_forwarded_for);
    if !policy
        .limiter
        .check_and_consume(policy.endpoint, &caller, policy.limit_per_minute)
    {
        warn!(endpoint = policy.endpoint, caller = %caller, "Rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "rate_limited",
                "error_description": "too many requests, retry later"
            })),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        return response;
    }
    next.run(request).await
}

fn caller_key(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(forwarded) = forwarded {
            return forwarded.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
