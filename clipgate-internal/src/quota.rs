use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{Principal, PrincipalStore};
use crate::error::Error;
use crate::store::SharedStore;

pub const QUOTA_USED_KEY_PREFIX: &str = "quota:used:";

/// Snapshot of a principal's monthly allowance at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub has_quota: bool,
    pub remaining: u64,
}

#[derive(Debug, Default)]
pub struct QuotaTrackerMetrics {
    consumed: AtomicU64,
    denied: AtomicU64,
    fail_open: AtomicU64,
}

impl QuotaTrackerMetrics {
    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QuotaTrackerMetricsSnapshot {
        QuotaTrackerMetricsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaTrackerMetricsSnapshot {
    pub consumed: u64,
    pub denied: u64,
    pub fail_open: u64,
}

/// Monthly usage counter per principal, backed by the shared store so every
/// gateway instance sees the same count. The used counter carries no TTL;
/// `reset_period` is the explicit rollover. When the store is disabled or
/// unreachable the check fails open.
pub struct QuotaTracker {
    store: SharedStore,
    principals: PrincipalStore,
    metrics: Arc<QuotaTrackerMetrics>,
}

impl QuotaTracker {
    pub fn new(store: SharedStore, principals: PrincipalStore) -> Self {
        Self {
            store,
            principals,
            metrics: Arc::new(QuotaTrackerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<QuotaTrackerMetrics> {
        self.metrics.clone()
    }

    fn used_key(principal_id: Uuid) -> String {
        format!("{QUOTA_USED_KEY_PREFIX}{principal_id}")
    }

    /// Read the remaining allowance without consuming any of it. A missing
    /// counter reads as zero used.
    pub async fn check_remaining(&self, principal: &Principal) -> QuotaDecision {
        if !self.store.is_enabled() {
            self.metrics.record_fail_open();
            return QuotaDecision {
                has_quota: true,
                remaining: 0,
            };
        }

        match self.store.get(&Self::used_key(principal.id)).await {
            Ok(value) => {
                let used = match value {
                    Some(raw) => match raw.parse::<u64>() {
                        Ok(n) => n,
                        Err(_) => {
                            tracing::warn!(
                                principal_id = %principal.id,
                                value = %raw,
                                "quota counter holds a non-numeric value, reading as 0",
                            );
                            0
                        }
                    },
                    None => 0,
                };
                let remaining = principal.monthly_quota.saturating_sub(used);
                if remaining == 0 {
                    self.metrics.record_denied();
                }
                QuotaDecision {
                    has_quota: remaining > 0,
                    remaining,
                }
            }
            Err(_) => {
                // The store op already logged the failure
                self.metrics.record_fail_open();
                tracing::warn!(
                    principal_id = %principal.id,
                    "quota check failed, failing open",
                );
                QuotaDecision {
                    has_quota: true,
                    remaining: 0,
                }
            }
        }
    }

    /// Count one billable request against the principal and touch its
    /// last-activity timestamp. Returns whether the shared counter moved;
    /// a store failure warns but never fails the request.
    pub async fn consume(&self, principal: &Principal) -> bool {
        self.principals.touch(principal.id);

        if !self.store.is_enabled() {
            tracing::debug!(
                principal_id = %principal.id,
                "shared store disabled, quota not counted",
            );
            return false;
        }

        match self.store.incr(&Self::used_key(principal.id)).await {
            Ok(used) => {
                self.metrics.record_consumed();
                tracing::debug!(principal_id = %principal.id, used, "quota consumed");
                true
            }
            Err(_) => {
                tracing::warn!(
                    principal_id = %principal.id,
                    "failed to count quota usage, request proceeds",
                );
                false
            }
        }
    }

    /// Delete the used counter. This is the period rollover, driven by
    /// maintenance tooling rather than the request path.
    pub async fn reset_period(&self, principal_id: Uuid) -> Result<(), Error> {
        self.store.delete(&Self::used_key(principal_id)).await
    }
}
