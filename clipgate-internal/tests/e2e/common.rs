//! Shared helpers for the end-to-end suite.
//!
//! Scenarios run against the full router (auth middleware included) with a
//! mock shared store and a scripted extractor, so the whole request pipeline
//! is exercised without Redis or upstream network access.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use clipgate_internal::config_parser::Config;
use clipgate_internal::extractor::{
    ExtractOptions, ExtractionFailure, ExtractionRetrier, ResolvedVideo, VideoExtractor,
    VideoMetadata,
};
use clipgate_internal::gateway_util::{build_router, AppStateData};
use clipgate_internal::store::SharedStore;

/// A well-formed TikTok URL for requests that should reach the extractor.
pub const VIDEO_URL: &str = "https://www.tiktok.com/@creator/video/7301234567890123456";

/// Extractor double: serves an optional scripted prefix of outcomes, then a
/// steady-state outcome, counting invocations throughout.
pub struct ScriptedExtractor {
    calls: AtomicU32,
    script: Mutex<VecDeque<Outcome>>,
    steady: Outcome,
}

#[derive(Clone)]
enum Outcome {
    Resolve,
    Fail(String),
}

impl ScriptedExtractor {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            steady: Outcome::Resolve,
        })
    }

    pub fn failing_with(message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            steady: Outcome::Fail(message.to_string()),
        })
    }

    /// Fail the first `failures` calls with `message`, then succeed.
    pub fn recovering_after(failures: usize, message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(
                std::iter::repeat_with(|| Outcome::Fail(message.to_string()))
                    .take(failures)
                    .collect(),
            ),
            steady: Outcome::Resolve,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VideoExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        _url: &str,
        options: &ExtractOptions,
    ) -> Result<ResolvedVideo, ExtractionFailure> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let outcome = self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_else(|| self.steady.clone());
        match outcome {
            Outcome::Resolve => Ok(ResolvedVideo {
                video_url: "https://cdn.example.com/resolved.mp4".to_string(),
                metadata: options.want_metadata.then(|| VideoMetadata {
                    video_id: "7301234567890123456".to_string(),
                    author: Some("creator".to_string()),
                    description: Some("an e2e fixture".to_string()),
                    country: options.want_country.then(|| "US".to_string()),
                    ..Default::default()
                }),
            }),
            Outcome::Fail(message) => Err(ExtractionFailure::classify(message)),
        }
    }
}

/// A gateway assembled from an inline TOML config, reachable through
/// `oneshot` dispatch. The store handle stays visible so scenarios can
/// assert on counters, cached entries, and the usage stream.
pub struct TestGateway {
    pub router: Router,
    pub store: SharedStore,
}

impl TestGateway {
    pub async fn request(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router dispatch failed")
    }

    pub async fn post_extract(&self, api_key: Option<&str>, body: Value) -> Response {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/video/extract")
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        let request = builder
            .body(Body::from(body.to_string()))
            .expect("request build failed");
        self.request(request).await
    }

    pub async fn get(&self, uri: &str) -> Response {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request build failed");
        self.request(request).await
    }

    pub fn stream_entries(&self, stream: &str) -> Vec<Vec<(String, String)>> {
        self.store
            .mock_state()
            .expect("gateway was not built on a mock store")
            .stream_entries(stream)
    }

    pub fn store_entry(&self, key: &str) -> Option<String> {
        self.store
            .mock_state()
            .expect("gateway was not built on a mock store")
            .entry(key)
    }
}

/// Build a gateway from an inline TOML config, backed by a mock store and
/// the given extractor.
pub fn make_gateway_with_config(
    config_content: &str,
    extractor: Arc<dyn VideoExtractor>,
) -> TestGateway {
    make_gateway_on_store(config_content, SharedStore::new_mock(), extractor)
}

pub fn make_gateway_on_store(
    config_content: &str,
    store: SharedStore,
    extractor: Arc<dyn VideoExtractor>,
) -> TestGateway {
    let mut file = tempfile::NamedTempFile::new().expect("temp config create failed");
    file.write_all(config_content.as_bytes())
        .expect("temp config write failed");
    let config = Config::load_from_path(file.path()).expect("config parse failed");

    let retrier = Arc::new(ExtractionRetrier::new(extractor, &config.extractor));
    let state = AppStateData::new_with_store(Arc::new(config), store.clone())
        .expect("app state build failed")
        .with_retrier(retrier);

    TestGateway {
        router: build_router(state),
        store,
    }
}

/// Gateway with one seeded principal per plan tier, on catalog limits.
pub fn make_seeded_gateway(extractor: Arc<dyn VideoExtractor>) -> TestGateway {
    make_gateway_with_config(SEEDED_CONFIG, extractor)
}

pub const FREE_KEY: &str = "tk_free_e2e_0000000001";
pub const BASIC_KEY: &str = "tk_basic_e2e_000000001";
pub const PRO_KEY: &str = "tk_pro_e2e_00000000001";

pub const FREE_ID: &str = "0198f000-0000-7000-8000-000000000001";
pub const BASIC_ID: &str = "0198f000-0000-7000-8000-000000000002";
pub const PRO_ID: &str = "0198f000-0000-7000-8000-000000000003";

pub const SEEDED_CONFIG: &str = r#"
[principals."tk_free_e2e_0000000001"]
email = "free@example.com"
plan = "free"
id = "0198f000-0000-7000-8000-000000000001"

[principals."tk_basic_e2e_000000001"]
email = "basic@example.com"
plan = "basic"
id = "0198f000-0000-7000-8000-000000000002"

[principals."tk_pro_e2e_00000000001"]
email = "pro@example.com"
plan = "pro"
id = "0198f000-0000-7000-8000-000000000003"
"#;

pub async fn response_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read failed");
    serde_json::from_slice(&bytes).expect("body was not JSON")
}

pub async fn into_parts(response: Response) -> (StatusCode, HeaderMap, Value) {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response_json(response).await;
    (status, headers, body)
}

/// Pull one field out of a usage stream entry.
pub fn usage_field(entries: &[Vec<(String, String)>], index: usize, name: &str) -> String {
    entries[index]
        .iter()
        .find(|(field, _)| field == name)
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| panic!("usage record {index} has no field {name}"))
}
