//! Scenarios for every gate in front of extraction: credentials, account
//! state, plan entitlement, rate window, monthly quota, and request shape.

use axum::http::StatusCode;
use serde_json::json;

use clipgate_internal::cache::ExtractionCache;
use clipgate_internal::usage::USAGE_STREAM;

use crate::common::{
    into_parts, make_gateway_with_config, make_seeded_gateway, usage_field, ScriptedExtractor,
    FREE_ID, FREE_KEY, VIDEO_URL,
};

#[tokio::test]
async fn test_missing_api_key_is_unauthorized() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());

    let response = gateway.post_extract(None, json!({ "url": VIDEO_URL })).await;
    let (status, headers, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        headers.get("www-authenticate").and_then(|v| v.to_str().ok()),
        Some("ApiKey")
    );
    assert_eq!(body["error"], "api_key_missing");
    assert_eq!(extractor.calls(), 0);
    // Nobody to attribute the attempt to, so nothing is billed
    assert!(gateway.stream_entries(USAGE_STREAM).is_empty());
}

#[tokio::test]
async fn test_credential_without_prefix_is_rejected_before_lookup() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor);

    let response = gateway
        .post_extract(Some("sk_wrong_prefix_00001"), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "api_key_invalid_format");
    assert!(gateway.stream_entries(USAGE_STREAM).is_empty());
}

#[tokio::test]
async fn test_unknown_credential_is_rejected() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor);

    let response = gateway
        .post_extract(Some("tk_not_in_the_table_01"), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "api_key_not_found");
    assert!(gateway.stream_entries(USAGE_STREAM).is_empty());
}

const DISABLED_ACCOUNTS_CONFIG: &str = r#"
[principals."tk_suspended_000000001"]
email = "suspended@example.com"
plan = "basic"
status = "suspended"

[principals."tk_blocked_0000000001"]
email = "blocked@example.com"
plan = "pro"
is_blocked = true
block_reason = "chargeback"

[principals."tk_lapsed_00000000001"]
email = "lapsed@example.com"
plan = "pro"
subscription_end = "2020-01-01T00:00:00Z"
"#;

#[tokio::test]
async fn test_disabled_accounts_are_rejected_and_billed() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_gateway_with_config(DISABLED_ACCOUNTS_CONFIG, extractor.clone());

    for (key, kind) in [
        ("tk_suspended_000000001", "account_inactive"),
        ("tk_blocked_0000000001", "account_blocked"),
        ("tk_lapsed_00000000001", "subscription_expired"),
    ] {
        let response = gateway.post_extract(Some(key), json!({ "url": VIDEO_URL })).await;
        let (status, _, body) = into_parts(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "for {kind}");
        assert_eq!(body["error"], kind);
    }
    assert_eq!(extractor.calls(), 0);

    // These rejections resolved a principal, so each one is billed
    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(entries.len(), 3);
    assert_eq!(usage_field(&entries, 0, "error"), "account_inactive");
    assert_eq!(usage_field(&entries, 0, "email"), "suspended@example.com");
    assert_eq!(usage_field(&entries, 1, "error"), "account_blocked");
    assert_eq!(usage_field(&entries, 2, "error"), "subscription_expired");
    for index in 0..3 {
        assert_eq!(usage_field(&entries, index, "status_code"), "401");
        assert_eq!(usage_field(&entries, index, "success"), "false");
    }
}

#[tokio::test]
async fn test_blocked_account_detail_carries_the_reason() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_gateway_with_config(DISABLED_ACCOUNTS_CONFIG, extractor);

    let response = gateway
        .post_extract(Some("tk_blocked_0000000001"), json!({ "url": VIDEO_URL }))
        .await;
    let (_, _, body) = into_parts(response).await;
    assert_eq!(body["detail"], "Account blocked: chargeback");
}

const CAPPED_QUOTA_CONFIG: &str = r#"
[principals."tk_capped_0000000001a"]
email = "capped@example.com"
plan = "free"
id = "0198f000-0000-7000-8000-00000000000a"
monthly_quota = 2
"#;

#[tokio::test]
async fn test_exhausted_quota_rejects_without_extraction() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_gateway_with_config(CAPPED_QUOTA_CONFIG, extractor.clone());
    let key = "tk_capped_0000000001a";
    let quota_key = "quota:used:0198f000-0000-7000-8000-00000000000a";

    // Two distinct URLs so the cache stays out of the picture
    let first = gateway
        .post_extract(Some(key), json!({ "url": VIDEO_URL }))
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    let second = gateway
        .post_extract(
            Some(key),
            json!({ "url": "https://www.tiktok.com/@creator/video/7309999999999999999" }),
        )
        .await;
    let (_, _, second_body) = into_parts(second).await;
    assert_eq!(second_body["requests_remaining"], 1);

    let third = gateway
        .post_extract(Some(key), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(third).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    assert_eq!(body["detail"], "Monthly quota exceeded. Please upgrade your plan.");
    // The denied request extracted nothing and moved no counter
    assert_eq!(extractor.calls(), 2);
    assert_eq!(gateway.store_entry(quota_key).as_deref(), Some("2"));

    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(entries.len(), 3);
    assert_eq!(usage_field(&entries, 2, "error"), "quota_exceeded");
    assert_eq!(usage_field(&entries, 2, "status_code"), "429");
}

const ZERO_RATE_CONFIG: &str = r#"
[principals."tk_throttled_00000001"]
email = "throttled@example.com"
plan = "free"
rate_limit_per_minute = 0
"#;

#[tokio::test]
async fn test_rate_limited_request_carries_window_headers() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_gateway_with_config(ZERO_RATE_CONFIG, extractor.clone());

    let response = gateway
        .post_extract(Some("tk_throttled_00000001"), json!({ "url": VIDEO_URL }))
        .await;
    let (status, headers, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(
        headers.get("x-ratelimit-limit").and_then(|v| v.to_str().ok()),
        Some("0")
    );
    assert_eq!(
        headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
    let retry_after: u64 = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("retry-after header missing");
    assert!((1..=60).contains(&retry_after));

    // Denied ahead of quota and extraction
    assert_eq!(extractor.calls(), 0);
    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(entries.len(), 1);
    assert_eq!(usage_field(&entries, 0, "error"), "rate_limit_exceeded");
}

#[tokio::test]
async fn test_country_detection_is_plan_gated() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());

    let response = gateway
        .post_extract(
            Some(FREE_KEY),
            json!({ "url": VIDEO_URL, "extract_country": true }),
        )
        .await;
    let (status, _, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "feature_not_entitled");
    assert_eq!(
        body["detail"],
        "Country detection is only available for Pro and Business plans"
    );

    // Gated before any counter or cache moved
    assert_eq!(extractor.calls(), 0);
    assert!(gateway.store_entry(&format!("quota:used:{FREE_ID}")).is_none());
    assert!(gateway
        .store_entry(&ExtractionCache::fingerprint(VIDEO_URL, true))
        .is_none());

    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(entries.len(), 1);
    assert_eq!(usage_field(&entries, 0, "status_code"), "403");
}

#[tokio::test]
async fn test_non_tiktok_url_is_unprocessable() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());

    let response = gateway
        .post_extract(
            Some(FREE_KEY),
            json!({ "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ" }),
        )
        .await;
    let (status, _, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_url");
    assert_eq!(body["detail"], "Invalid TikTok URL format");
    assert_eq!(extractor.calls(), 0);

    // Validation rejections are billed
    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(entries.len(), 1);
    assert_eq!(usage_field(&entries, 0, "error"), "invalid_url");
}

#[tokio::test]
async fn test_malformed_body_is_unprocessable() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());

    // Wrong type for url
    let response = gateway
        .post_extract(Some(FREE_KEY), json!({ "url": 7 }))
        .await;
    let (status, _, body) = into_parts(response).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "json_request");

    // Unknown field
    let response = gateway
        .post_extract(
            Some(FREE_KEY),
            json!({ "url": VIDEO_URL, "want_metadata": true }),
        )
        .await;
    let (status, _, body) = into_parts(response).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "json_request");

    assert_eq!(extractor.calls(), 0);
}

#[tokio::test]
async fn test_disabled_auth_serves_anonymous_traffic() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_gateway_with_config("[auth]\nenabled = false\n", extractor);

    let response = gateway.post_extract(None, json!({ "url": VIDEO_URL })).await;
    let (status, _, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}
