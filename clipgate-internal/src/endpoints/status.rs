use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::gateway_util::AppState;
use crate::store::SharedStore;

pub const CLIPGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Liveness probe. Proves the process is serving requests and nothing more.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness report including the shared store. A disabled store is a
/// configuration choice, not a failure; an unreachable one degrades the
/// status and the response code.
pub async fn status_handler(State(state): AppState) -> Response {
    let store_status = match &state.shared_store {
        SharedStore::Disabled => "disabled",
        store => match store.health().await {
            Ok(()) => "ok",
            Err(_) => "unavailable",
        },
    };

    let status_code = if store_status == "unavailable" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = Json(json!({
        "service": "clipgate",
        "status": if store_status == "unavailable" { "degraded" } else { "ok" },
        "version": CLIPGATE_VERSION,
        "store": store_status,
    }));

    (status_code, body).into_response()
}
