//! Scenarios for the public surface around extraction: probes, routing, and
//! store degradation reporting.

use axum::http::StatusCode;
use serde_json::json;

use clipgate_internal::store::SharedStore;

use crate::common::{
    into_parts, make_gateway_on_store, make_seeded_gateway, ScriptedExtractor, PRO_KEY, VIDEO_URL,
};

#[tokio::test]
async fn test_health_probe() {
    let gateway = make_seeded_gateway(ScriptedExtractor::succeeding());

    let (status, _, body) = into_parts(gateway.get("/health").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_status_reports_store_health() {
    let gateway = make_seeded_gateway(ScriptedExtractor::succeeding());

    let (status, _, body) = into_parts(gateway.get("/status").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "clipgate");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_status_degrades_on_store_outage() {
    let gateway = make_seeded_gateway(ScriptedExtractor::succeeding());
    gateway
        .store
        .mock_state()
        .expect("mock store")
        .set_healthy(false);

    let (status, _, body) = into_parts(gateway.get("/status").await).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["store"], "unavailable");
}

#[tokio::test]
async fn test_status_reports_disabled_store_as_a_choice() {
    let gateway = make_gateway_on_store(
        "",
        SharedStore::new_disabled(),
        ScriptedExtractor::succeeding(),
    );

    let (status, _, body) = into_parts(gateway.get("/status").await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "disabled");
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let gateway = make_seeded_gateway(ScriptedExtractor::succeeding());

    let (status, _, body) = into_parts(gateway.get("/api/v2/nope").await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "route_not_found");
    assert_eq!(body["detail"], "Route not found: `GET /api/v2/nope`");
}

#[tokio::test]
async fn test_extract_route_rejects_wrong_method() {
    let gateway = make_seeded_gateway(ScriptedExtractor::succeeding());

    // The middleware resolves the key first, then the method router balks
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/api/v1/video/extract")
        .header("x-api-key", PRO_KEY)
        .body(axum::body::Body::empty())
        .expect("request build failed");
    let response = gateway.request(request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_store_outage_fails_open_for_extraction() {
    let extractor = ScriptedExtractor::succeeding();
    let gateway = make_seeded_gateway(extractor.clone());
    gateway
        .store
        .mock_state()
        .expect("mock store")
        .set_healthy(false);

    // Rate, quota, and cache all degrade; the request still succeeds
    let response = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["cached"], false);
    assert_eq!(extractor.calls(), 1);

    // With the counter unreadable, no allowance is promised
    assert_eq!(body["requests_remaining"], 0);

    // A repeat bypasses the broken cache and extracts again
    let response = gateway
        .post_extract(Some(PRO_KEY), json!({ "url": VIDEO_URL }))
        .await;
    let (status, _, body) = into_parts(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cached"], false);
    assert_eq!(extractor.calls(), 2);
}
