use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{debug_handler, Json};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

use crate::auth::Principal;
use crate::error::{Error, ErrorDetails};
use crate::extractor::{validate_url, ExtractOptions, VideoMetadata};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::rate_limit::RateLimitDecision;
use crate::usage::UsageRecord;

/// Route of the extraction endpoint, as recorded in the usage ledger.
pub const EXTRACT_PATH: &str = "/api/v1/video/extract";

/// The expected payload is a JSON object with the following fields:
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    // the video page URL to resolve
    pub url: String,
    // default true
    #[serde(default = "default_extract_metadata")]
    pub extract_metadata: bool,
    // plan-gated, default false
    #[serde(default)]
    pub extract_country: bool,
}

fn default_extract_metadata() -> bool {
    true
}

/// Response envelope for the extraction endpoint. Extraction failures are
/// reported in-body with `success: false` rather than as an HTTP error,
/// since the request itself was valid and billable.
#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub success: bool,
    pub video_url: Option<String>,
    pub metadata: Option<VideoMetadata>,
    pub cached: bool,
    /// Remaining monthly allowance as of the quota check, before this
    /// request was counted.
    pub requests_remaining: u64,
    pub process_time_ms: u64,
    pub error: Option<String>,
    pub detail: Option<String>,
}

/// Handler for the POST `/api/v1/video/extract` endpoint.
///
/// Gate order: URL validation, plan entitlement, rate limit, quota. The
/// entitlement check runs before any counter moves, so a request gated by
/// plan leaves no rate, quota, or cache side effects. Every rejection past
/// authentication is billed to the principal with a usage record.
#[instrument(
    name = "extract",
    skip_all,
    fields(url = %params.url, principal_id = %principal.id)
)]
#[debug_handler(state = AppStateData)]
pub async fn extract_handler(
    State(app_state): AppState,
    headers: HeaderMap,
    Extension(principal): Extension<Principal>,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Response, Error> {
    let started = Instant::now();

    if let Err(error) = validate_url(&params.url) {
        record_rejection(&app_state, &principal, &headers, &params.url, &error).await;
        return Err(error);
    }

    if params.extract_country && !principal.features.country_detection {
        let error = Error::new(ErrorDetails::FeatureNotEntitled {
            feature: "country_detection".to_string(),
            message: "Country detection is only available for Pro and Business plans"
                .to_string(),
        });
        record_rejection(&app_state, &principal, &headers, &params.url, &error).await;
        return Err(error);
    }

    if app_state.config.rate_limit.enabled {
        if let RateLimitDecision::Deny(rate_headers) =
            app_state.rate_limiter.check_and_consume(&principal).await
        {
            let error = Error::new(ErrorDetails::RateLimitExceeded {
                headers: rate_headers,
            });
            record_rejection(&app_state, &principal, &headers, &params.url, &error).await;
            return Err(error);
        }
    }

    // The pre-consumption snapshot is what the response reports; the
    // consume below is not reflected in it
    let mut requests_remaining = 0;
    if app_state.config.quota.enabled {
        let decision = app_state.quota_tracker.check_remaining(&principal).await;
        if !decision.has_quota {
            let error = Error::new(ErrorDetails::QuotaExceeded {
                limit: principal.monthly_quota,
            });
            record_rejection(&app_state, &principal, &headers, &params.url, &error).await;
            return Err(error);
        }
        requests_remaining = decision.remaining;
    }

    let labels = vec![
        ("endpoint", "extract".to_string()),
        ("plan", principal.plan.to_string()),
    ];
    counter!("request_count", &labels).increment(1);

    let options = ExtractOptions {
        want_metadata: params.extract_metadata,
        want_country: params.extract_country,
    };
    let outcome = app_state
        .extraction_cache
        .fetch_or_extract(Arc::clone(&app_state.retrier), &params.url, &options)
        .await;

    let process_time_ms = started.elapsed().as_millis() as u64;

    // Quota is charged once per request whatever the outcome: a cache hit
    // is still a served request, and a failed extraction still spent the
    // compute
    if app_state.config.quota.enabled {
        app_state.quota_tracker.consume(&principal).await;
    }

    let mut record = UsageRecord::new(&principal, EXTRACT_PATH).with_client(&headers);
    record.video_url = Some(params.url.clone());
    record.latency_ms = process_time_ms;

    let body = match outcome {
        Ok((entry, cached)) => {
            if cached {
                tracing::info!(url = %params.url, "cache hit");
            } else {
                tracing::info!(url = %params.url, "extracted");
            }
            record.success = true;
            record.status_code = 200;
            record.cached = cached;
            ExtractResponse {
                success: true,
                video_url: Some(entry.video_url),
                metadata: entry.metadata,
                cached,
                requests_remaining,
                process_time_ms,
                error: None,
                detail: None,
            }
        }
        Err(failure) => {
            tracing::warn!(
                url = %params.url,
                kind = %failure.kind,
                "extraction failed: {}",
                failure.message,
            );
            record.status_code = 400;
            record.error = Some(failure.kind.to_string());
            ExtractResponse {
                success: false,
                video_url: None,
                metadata: None,
                cached: false,
                requests_remaining,
                process_time_ms,
                error: Some(failure.kind.to_string()),
                detail: Some(failure.message),
            }
        }
    };
    app_state.usage_recorder.append(record).await;

    Ok(Json(body).into_response())
}

/// Bill a rejected request to its principal. The rejection itself has
/// already been logged by the error constructor.
async fn record_rejection(
    app_state: &AppStateData,
    principal: &Principal,
    headers: &HeaderMap,
    url: &str,
    error: &Error,
) {
    let mut record = UsageRecord::new(principal, EXTRACT_PATH).with_client(headers);
    record.video_url = Some(url.to_string());
    record.status_code = error.status_code().as_u16();
    record.error = Some(error.kind().to_string());
    app_state.usage_recorder.append(record).await;
}
