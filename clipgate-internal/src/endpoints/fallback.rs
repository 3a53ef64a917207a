use axum::extract::OriginalUri;
use axum::http::Method;

use crate::error::{Error, ErrorDetails};

/// 404 handler for routes nothing else matched.
pub async fn handle_404(method: Method, original_uri: OriginalUri) -> Error {
    Error::new(ErrorDetails::RouteNotFound {
        path: original_uri.0.path().to_string(),
        method: method.to_string(),
    })
}
