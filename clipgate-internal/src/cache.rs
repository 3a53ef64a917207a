use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config_parser::CacheConfig;
use crate::error::{Error, ErrorDetails};
use crate::extractor::{
    ExtractOptions, ExtractionErrorKind, ExtractionFailure, ExtractionRetrier, VideoMetadata,
};
use crate::store::SharedStore;

/// Prefix for cache keys in the shared store.
pub const CACHE_KEY_PREFIX: &str = "video:";

/// A successful extraction as stored in the shared cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedExtraction {
    pub video_url: String,
    pub metadata: Option<VideoMetadata>,
    pub cached_at: DateTime<Utc>,
}

type SharedExtraction = Shared<BoxFuture<'static, Result<CachedExtraction, ExtractionFailure>>>;

/// Hit, miss, bypass, and collapse counters for the cache.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    collapsed: AtomicU64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collapsed(&self) {
        self.collapsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            collapsed: self.collapsed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub collapsed: u64,
}

/// Shared extraction cache with in-process single-flight collapsing.
///
/// Entries are keyed by request fingerprint and shared across principals.
/// Only successful extractions are written. When the store is down the cache
/// is bypassed and every request extracts directly; concurrent identical
/// misses within one process still collapse onto a single extraction.
pub struct ExtractionCache {
    store: SharedStore,
    enabled: bool,
    ttl_s: u64,
    in_flight: DashMap<String, SharedExtraction>,
    metrics: Arc<CacheMetrics>,
}

impl ExtractionCache {
    pub fn new(store: SharedStore, config: &CacheConfig) -> Self {
        Self {
            store,
            enabled: config.enabled,
            ttl_s: config.ttl_s,
            in_flight: DashMap::new(),
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        self.metrics.clone()
    }

    /// Deterministic cache key for a request. The URL is trimmed of
    /// surrounding whitespace; the country flag is part of the key because
    /// it changes the stored payload.
    pub fn fingerprint(url: &str, want_country: bool) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.trim().as_bytes());
        hasher.update(b":");
        hasher.update(if want_country {
            b"true".as_slice()
        } else {
            b"false".as_slice()
        });
        format!("{CACHE_KEY_PREFIX}{:x}", hasher.finalize())
    }

    /// Read an entry. Miss, decode failure, and store outage all read as
    /// `None`; an outage additionally counts a bypass.
    pub async fn get(&self, fingerprint: &str) -> Option<CachedExtraction> {
        if !self.enabled || !self.store.is_enabled() {
            self.metrics.record_bypass();
            return None;
        }
        match self.store.get(fingerprint).await {
            Ok(Some(payload)) => match serde_json::from_str::<CachedExtraction>(&payload) {
                Ok(entry) => {
                    self.metrics.record_hit();
                    Some(entry)
                }
                Err(e) => {
                    Error::new(ErrorDetails::Serialization {
                        message: format!("Discarding undecodable cache entry {fingerprint}: {e}"),
                    });
                    // Drop the corrupt entry so it cannot shadow a rewrite
                    let _ = self.store.delete(fingerprint).await;
                    self.metrics.record_miss();
                    None
                }
            },
            Ok(None) => {
                self.metrics.record_miss();
                None
            }
            Err(_) => {
                // The store op already logged the failure
                self.metrics.record_bypass();
                tracing::warn!(fingerprint, "cache unavailable, bypassing");
                None
            }
        }
    }

    /// Write an entry with the configured TTL. Write failures warn and are
    /// swallowed; the response does not depend on them.
    pub async fn set(&self, fingerprint: &str, entry: &CachedExtraction) {
        if !self.enabled || !self.store.is_enabled() {
            return;
        }
        let payload = match serde_json::to_string(entry) {
            Ok(payload) => payload,
            Err(e) => {
                Error::new(ErrorDetails::Serialization {
                    message: format!("Failed to serialize cache entry {fingerprint}: {e}"),
                });
                return;
            }
        };
        if self
            .store
            .set_ex(fingerprint, &payload, self.ttl_s)
            .await
            .is_err()
        {
            tracing::warn!(fingerprint, "cache write skipped");
        }
    }

    /// Invalidation hook for maintenance tooling.
    pub async fn delete(&self, fingerprint: &str) -> Result<(), Error> {
        self.store.delete(fingerprint).await
    }

    /// Resolve a request through the cache: a hit returns immediately, a
    /// miss runs the extraction exactly once per fingerprint per process.
    ///
    /// The returned flag reports whether the result came from the cache.
    /// The leading extraction runs on a detached task, so a caller that
    /// disconnects mid-flight never cancels work that followers (or the
    /// cache write) depend on.
    pub async fn fetch_or_extract(
        self: &Arc<Self>,
        retrier: Arc<ExtractionRetrier>,
        url: &str,
        options: &ExtractOptions,
    ) -> Result<(CachedExtraction, bool), ExtractionFailure> {
        let fingerprint = Self::fingerprint(url, options.want_country);

        if let Some(entry) = self.get(&fingerprint).await {
            return Ok((entry, true));
        }

        let (shared, leader_tx) = match self.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                let (tx, rx) = tokio::sync::oneshot::channel();
                let shared: SharedExtraction = async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(ExtractionFailure::new(
                            ExtractionErrorKind::Unknown,
                            "Extraction task dropped before completing",
                        ))
                    })
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                (shared, Some(tx))
            }
        };

        match leader_tx {
            Some(tx) => {
                let cache = Arc::clone(self);
                let url = url.to_string();
                let options = *options;
                tokio::spawn(async move {
                    let outcome = match retrier.extract(&url, &options).await {
                        Ok(resolved) => {
                            let entry = CachedExtraction {
                                video_url: resolved.video_url,
                                metadata: resolved.metadata,
                                cached_at: Utc::now(),
                            };
                            cache.set(&fingerprint, &entry).await;
                            Ok(entry)
                        }
                        Err(failure) => Err(failure),
                    };
                    // The cache write (on success) lands before the slot is
                    // released, so later requests observe the hit
                    cache.in_flight.remove(&fingerprint);
                    // Every follower may have given up by now
                    let _ = tx.send(outcome);
                });
            }
            None => {
                self.metrics.record_collapsed();
                tracing::debug!(fingerprint, "joining in-flight extraction");
            }
        }

        shared.await.map(|entry| (entry, false))
    }
}
