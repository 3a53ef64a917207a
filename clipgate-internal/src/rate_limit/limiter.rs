use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::auth::Principal;
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders, RateLimiterMetrics, WINDOW_SECS};
use crate::store::SharedStore;

const RATE_WINDOW_KEY_PREFIX: &str = "rate:";

/// Returns the current Unix timestamp.
/// Returns 0 if system time is before UNIX_EPOCH (extremely rare).
fn get_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Fixed-window per-minute limiter on the shared store.
///
/// The window key is `(principal id, floor(now / 60))` and the counter moves
/// with a single atomic increment-then-compare, so concurrent requests across
/// gateway instances cannot lose updates. A denied request's increment is not
/// compensated. When the store is disabled or unreachable the limiter fails
/// open.
pub struct FixedWindowLimiter {
    store: SharedStore,
    metrics: Arc<RateLimiterMetrics>,
}

impl FixedWindowLimiter {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            metrics: Arc::new(RateLimiterMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &RateLimiterMetrics {
        &self.metrics
    }

    pub async fn check_and_consume(&self, principal: &Principal) -> RateLimitDecision {
        self.check_and_consume_at(principal, get_unix_timestamp())
            .await
    }

    /// Window arithmetic with an injectable clock, for tests.
    pub async fn check_and_consume_at(&self, principal: &Principal, now: u64) -> RateLimitDecision {
        let limit = principal.rate_limit_per_minute;

        if !self.store.is_enabled() {
            self.metrics.record_fail_open();
            return RateLimitDecision::Allow { remaining: limit };
        }

        let window = now / WINDOW_SECS;
        let key = format!("{RATE_WINDOW_KEY_PREFIX}{}:{window}", principal.id);
        match self.store.incr_with_ttl(&key, WINDOW_SECS).await {
            Ok(count) => {
                let used = u32::try_from(count).unwrap_or(u32::MAX);
                if used <= limit {
                    self.metrics.record_allowed();
                    RateLimitDecision::Allow {
                        remaining: limit - used,
                    }
                } else {
                    self.metrics.record_denied();
                    tracing::debug!(
                        principal_id = %principal.id,
                        limit,
                        window,
                        "rate window exhausted",
                    );
                    RateLimitDecision::Deny(RateLimitHeaders {
                        limit,
                        remaining: 0,
                        reset: (window + 1) * WINDOW_SECS,
                        retry_after_secs: WINDOW_SECS - (now % WINDOW_SECS),
                    })
                }
            }
            Err(_) => {
                // The store op already logged the failure
                self.metrics.record_store_error();
                self.metrics.record_fail_open();
                tracing::warn!(
                    principal_id = %principal.id,
                    "rate limit check failed, failing open",
                );
                RateLimitDecision::Allow { remaining: limit }
            }
        }
    }
}
