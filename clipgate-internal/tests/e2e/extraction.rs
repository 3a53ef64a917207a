//! Full-pipeline extraction scenarios: authenticated requests through the
//! router, cache behavior on repeat requests, and logical failures.

use axum::http::StatusCode;
use serde_json::json;

use clipgate_internal::cache::ExtractionCache;
use clipgate_internal::usage::USAGE_STREAM;

use crate::common::{
    into_parts, make_seeded_gateway, usage_field, ScriptedExtractor, PRO_ID, PRO_KEY, VIDEO_URL,
};

#[tokio::test]
async fn test_cold_request_extracts_and_caches() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());

    let response = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["cached"], false);
    assert_eq!(body["video_url"], "https://cdn.example.com/resolved.mp4");
    assert_eq!(body["metadata"]["video_id"], "7301234567890123456");
    assert_eq!(body["metadata"]["author"], "creator");
    assert_eq!(body["error"], serde_json::Value::Null);
    assert_eq!(body["detail"], serde_json::Value::Null);
    // Pro catalog quota, snapshotted before this request was counted
    assert_eq!(body["requests_remaining"], 10_000);
    assert!(body["process_time_ms"].is_u64());

    assert_eq!(extractor.calls(), 1);
    let fingerprint = ExtractionCache::fingerprint(VIDEO_URL, false);
    assert!(gateway.store_entry(&fingerprint).is_some());
    assert_eq!(
        gateway.store_entry(&format!("quota:used:{PRO_ID}")).as_deref(),
        Some("1")
    );

    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(entries.len(), 1);
    assert_eq!(usage_field(&entries, 0, "success"), "true");
    assert_eq!(usage_field(&entries, 0, "cached"), "false");
    assert_eq!(usage_field(&entries, 0, "video_url"), VIDEO_URL);
    assert_eq!(usage_field(&entries, 0, "email"), "pro@example.com");
    // Only the masked form of the credential is ever written out
    assert_eq!(usage_field(&entries, 0, "api_key_masked"), "tk_pro***0001");
}

#[tokio::test]
async fn test_repeat_request_is_served_from_cache() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());

    let first = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (_, _, first_body) = into_parts(first).await;

    let second = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, second_body) = into_parts(second).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second_body["cached"], true);
    assert_eq!(second_body["video_url"], first_body["video_url"]);
    assert_eq!(second_body["metadata"], first_body["metadata"]);
    // One fewer remaining, one extraction total, both requests billed
    assert_eq!(second_body["requests_remaining"], 9_999);
    assert_eq!(extractor.calls(), 1);
    assert_eq!(
        gateway.store_entry(&format!("quota:used:{PRO_ID}")).as_deref(),
        Some("2")
    );

    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(entries.len(), 2);
    assert_eq!(usage_field(&entries, 1, "cached"), "true");
    assert_eq!(usage_field(&entries, 1, "success"), "true");
}

#[tokio::test]
async fn test_country_flag_keys_a_separate_cache_entry() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());

    let plain = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (_, _, plain_body) = into_parts(plain).await;
    assert_eq!(plain_body["metadata"]["country"], serde_json::Value::Null);

    // Same URL with country detection resolves again rather than replaying
    // the cached countryless entry
    let with_country = gateway
        .post_extract(
            Some(PRO_KEY),
            json!({ "url": VIDEO_URL, "extract_country": true }),
        )
        .await;
    let (status, _, country_body) = into_parts(with_country).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(country_body["cached"], false);
    assert_eq!(country_body["metadata"]["country"], "US");
    assert_eq!(extractor.calls(), 2);

    assert!(gateway
        .store_entry(&ExtractionCache::fingerprint(VIDEO_URL, false))
        .is_some());
    assert!(gateway
        .store_entry(&ExtractionCache::fingerprint(VIDEO_URL, true))
        .is_some());
}

#[tokio::test]
async fn test_metadata_omitted_when_not_requested() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor);

    let response = gateway
        .post_extract(
            Some(PRO_KEY),
            json!({ "url": VIDEO_URL, "extract_metadata": false }),
        )
        .await;
    let (status, _, body) = into_parts(response).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["metadata"], serde_json::Value::Null);
}

#[tokio::test(start_paused = true)]
async fn test_unresolvable_video_reports_in_body() {
    let extractor = ScriptedExtractor::failing_with("Video is private");
    let gateway = make_seeded_gateway(extractor.clone());

    let response = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(response).await;

    // The request was valid and billable, so the failure is a logical one
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["video_url"], serde_json::Value::Null);
    assert_eq!(body["error"], "private");
    assert_eq!(body["detail"], "Video is private");

    // All three attempts were spent before giving up
    assert_eq!(extractor.calls(), 3);

    // Failures are never cached and still consume quota
    let fingerprint = ExtractionCache::fingerprint(VIDEO_URL, false);
    assert!(gateway.store_entry(&fingerprint).is_none());
    assert_eq!(
        gateway.store_entry(&format!("quota:used:{PRO_ID}")).as_deref(),
        Some("1")
    );

    let entries = gateway.stream_entries(USAGE_STREAM);
    assert_eq!(usage_field(&entries, 0, "success"), "false");
    assert_eq!(usage_field(&entries, 0, "status_code"), "400");
    assert_eq!(usage_field(&entries, 0, "error"), "private");
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_within_the_attempt_budget() {
    let extractor =
        ScriptedExtractor::recovering_after(2, "Upstream responded with HTTP 503");
    let gateway = make_seeded_gateway(extractor.clone());

    let response = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(response).await;

    // Third attempt landed, so the caller sees an ordinary success
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["cached"], false);
    assert_eq!(extractor.calls(), 3);

    // And the recovered result is cached like any other
    let fingerprint = ExtractionCache::fingerprint(VIDEO_URL, false);
    assert!(gateway.store_entry(&fingerprint).is_some());
}
