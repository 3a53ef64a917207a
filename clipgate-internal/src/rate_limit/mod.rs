pub mod limiter;

pub use limiter::FixedWindowLimiter;

use std::sync::atomic::{AtomicU64, Ordering};

use http::{HeaderMap, HeaderName, HeaderValue};

/// Length of the fixed rate window.
pub const WINDOW_SECS: u64 = 60;

/// Header bundle attached to rate-limited responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    /// Unix second at which the current window closes.
    pub reset: u64,
    pub retry_after_secs: u64,
}

impl RateLimitHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(4);
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(self.limit),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(self.reset),
        );
        headers.insert(
            HeaderName::from_static("retry-after"),
            HeaderValue::from(self.retry_after_secs),
        );
        headers
    }
}

/// Rate limit decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow { remaining: u32 },
    Deny(RateLimitHeaders),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow { .. })
    }
}

/// Outcome counters for the limiter.
#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    fail_open: AtomicU64,
    store_errors: AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimiterMetricsSnapshot {
        RateLimiterMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub fail_open: u64,
    pub store_errors: u64,
}
