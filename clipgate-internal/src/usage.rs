use axum::extract::Request;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{Error, ErrorDetails};
use crate::store::SharedStore;

/// Stream the usage ledger is appended to.
pub const USAGE_STREAM: &str = "usage:log";

/// Approximate cap on the stream. Downstream consumers (billing, analytics)
/// are expected to drain entries well before this is reached.
pub const USAGE_STREAM_MAXLEN: usize = 100_000;

/// One line of the usage ledger: who asked for what, what came back, and how
/// long it took. Appended for every billable request, including rejections of
/// a resolved principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub email: String,
    /// Masked credential, never the plaintext key.
    pub api_key_masked: String,
    pub endpoint: String,
    pub video_url: Option<String>,
    pub success: bool,
    pub status_code: u16,
    pub cached: bool,
    pub latency_ms: u64,
    /// Stable error kind when the request did not succeed.
    pub error: Option<String>,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(principal: &Principal, endpoint: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            principal_id: principal.id,
            email: principal.email.clone(),
            api_key_masked: principal.key_masked.clone(),
            endpoint: endpoint.into(),
            video_url: None,
            success: false,
            status_code: 0,
            cached: false,
            latency_ms: 0,
            error: None,
            client_ip: "unknown".to_string(),
            user_agent: None,
            created_at: Utc::now(),
        }
    }

    /// Fill in client network metadata from request headers.
    pub fn with_client(mut self, headers: &HeaderMap) -> Self {
        self.client_ip = client_ip(headers);
        self.user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        self
    }

    /// Record for a request rejected after its principal was resolved,
    /// such as a blocked account or an expired subscription.
    pub fn for_rejection(
        principal: &Principal,
        request: &Request,
        status_code: u16,
        error_kind: &str,
    ) -> Self {
        let mut record =
            Self::new(principal, request.uri().path()).with_client(request.headers());
        record.status_code = status_code;
        record.error = Some(error_kind.to_string());
        record
    }

    /// Flatten into stream fields. Stream entries cannot hold nulls, so
    /// absent optionals become empty strings.
    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.to_string()),
            ("principal_id", self.principal_id.to_string()),
            ("email", self.email.clone()),
            ("api_key_masked", self.api_key_masked.clone()),
            ("endpoint", self.endpoint.clone()),
            ("video_url", self.video_url.clone().unwrap_or_default()),
            ("success", self.success.to_string()),
            ("status_code", self.status_code.to_string()),
            ("cached", self.cached.to_string()),
            ("latency_ms", self.latency_ms.to_string()),
            ("error", self.error.clone().unwrap_or_default()),
            ("client_ip", self.client_ip.clone()),
            ("user_agent", self.user_agent.clone().unwrap_or_default()),
            ("created_at", self.created_at.to_rfc3339()),
        ]
    }
}

/// Best-effort client address: first hop of `X-Forwarded-For`, then
/// `X-Real-IP`, then `"unknown"`.
fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    "unknown".to_string()
}

/// Append and drop counters for the recorder.
#[derive(Debug, Default)]
pub struct UsageRecorderMetrics {
    appended: AtomicU64,
    dropped: AtomicU64,
}

impl UsageRecorderMetrics {
    pub fn record_appended(&self) {
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageRecorderMetricsSnapshot {
        UsageRecorderMetricsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageRecorderMetricsSnapshot {
    pub appended: u64,
    pub dropped: u64,
}

/// Appends usage records to the shared stream. Recording is best-effort:
/// a failed append warns and drops the record, never the request.
pub struct UsageRecorder {
    store: SharedStore,
    metrics: Arc<UsageRecorderMetrics>,
}

impl UsageRecorder {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            metrics: Arc::new(UsageRecorderMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<UsageRecorderMetrics> {
        self.metrics.clone()
    }

    async fn try_append(&self, record: &UsageRecord) -> Result<(), Error> {
        let fields = record.to_fields();
        self.store
            .xadd_capped(USAGE_STREAM, USAGE_STREAM_MAXLEN, &fields)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::UsageAppend {
                    message: e.to_string(),
                })
            })
    }

    pub async fn append(&self, record: UsageRecord) {
        if !self.store.is_enabled() {
            self.metrics.record_dropped();
            tracing::debug!(
                principal_id = %record.principal_id,
                "shared store disabled, usage record dropped",
            );
            return;
        }

        match self.try_append(&record).await {
            Ok(()) => self.metrics.record_appended(),
            // The append error already logged itself
            Err(_) => self.metrics.record_dropped(),
        }
    }
}
