use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::fmt::{Debug, Display};
use tokio::sync::OnceCell;

use crate::rate_limit::RateLimitHeaders;

/// Controls whether to include raw upstream request/response details in error
/// output.
///
/// When true:
/// - Raw upstream details are logged for extraction errors
/// - Raw details are included in error response bodies
///
/// WARNING: Setting this to true will expose potentially sensitive
/// request/response data in logs and error responses. Use with caution.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *DEBUG.get().unwrap_or(&false) {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn kind(&self) -> &'static str {
        self.0.kind()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Builds the JSON body sent to clients for this error.
    pub fn to_response_json(&self) -> Value {
        json!({
            "error": self.kind(),
            "detail": self.to_string(),
        })
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AccountBlocked {
        reason: Option<String>,
    },
    AccountInactive {
        status: String,
    },
    ApiKeyInvalidFormat,
    ApiKeyMissing,
    ApiKeyNotFound,
    AppState {
        message: String,
    },
    Cache {
        message: String,
    },
    Config {
        message: String,
    },
    FeatureNotEntitled {
        feature: String,
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidUrl {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    Observability {
        message: String,
    },
    QuotaExceeded {
        limit: u64,
    },
    RateLimitExceeded {
        headers: RateLimitHeaders,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Serialization {
        message: String,
    },
    StoreUnavailable {
        message: String,
    },
    SubscriptionExpired,
    UsageAppend {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AccountBlocked { .. } => tracing::Level::WARN,
            ErrorDetails::AccountInactive { .. } => tracing::Level::WARN,
            ErrorDetails::ApiKeyInvalidFormat => tracing::Level::WARN,
            ErrorDetails::ApiKeyMissing => tracing::Level::WARN,
            ErrorDetails::ApiKeyNotFound => tracing::Level::WARN,
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Cache { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::FeatureNotEntitled { .. } => tracing::Level::WARN,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidUrl { .. } => tracing::Level::INFO,
            ErrorDetails::JsonRequest { .. } => tracing::Level::INFO,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::RateLimitExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::DEBUG,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::SubscriptionExpired => tracing::Level::WARN,
            ErrorDetails::UsageAppend { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AccountBlocked { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::AccountInactive { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::ApiKeyInvalidFormat => StatusCode::UNAUTHORIZED,
            ErrorDetails::ApiKeyMissing => StatusCode::UNAUTHORIZED,
            ErrorDetails::ApiKeyNotFound => StatusCode::UNAUTHORIZED,
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::FeatureNotEntitled { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidUrl { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorDetails::JsonRequest { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::SubscriptionExpired => StatusCode::UNAUTHORIZED,
            ErrorDetails::UsageAppend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable name for the `error` field of response bodies
    /// and usage records.
    pub fn kind(&self) -> &'static str {
        match self {
            ErrorDetails::AccountBlocked { .. } => "account_blocked",
            ErrorDetails::AccountInactive { .. } => "account_inactive",
            ErrorDetails::ApiKeyInvalidFormat => "api_key_invalid_format",
            ErrorDetails::ApiKeyMissing => "api_key_missing",
            ErrorDetails::ApiKeyNotFound => "api_key_not_found",
            ErrorDetails::AppState { .. } => "app_state",
            ErrorDetails::Cache { .. } => "cache",
            ErrorDetails::Config { .. } => "config",
            ErrorDetails::FeatureNotEntitled { .. } => "feature_not_entitled",
            ErrorDetails::InternalError { .. } => "internal_error",
            ErrorDetails::InvalidUrl { .. } => "invalid_url",
            ErrorDetails::JsonRequest { .. } => "json_request",
            ErrorDetails::Observability { .. } => "observability",
            ErrorDetails::QuotaExceeded { .. } => "quota_exceeded",
            ErrorDetails::RateLimitExceeded { .. } => "rate_limit_exceeded",
            ErrorDetails::RouteNotFound { .. } => "route_not_found",
            ErrorDetails::Serialization { .. } => "serialization",
            ErrorDetails::StoreUnavailable { .. } => "store_unavailable",
            ErrorDetails::SubscriptionExpired => "subscription_expired",
            ErrorDetails::UsageAppend { .. } => "usage_append",
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AccountBlocked { reason } => {
                write!(
                    f,
                    "Account blocked: {}",
                    reason.as_deref().unwrap_or("Contact support")
                )
            }
            ErrorDetails::AccountInactive { status } => {
                write!(f, "Account is {status}")
            }
            ErrorDetails::ApiKeyInvalidFormat => {
                write!(f, "Invalid API key format")
            }
            ErrorDetails::ApiKeyMissing => {
                write!(f, "Invalid API Key. Please check your credentials.")
            }
            ErrorDetails::ApiKeyNotFound => {
                write!(f, "Invalid API key")
            }
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Cache { message } => {
                write!(f, "Cache error: {message}")
            }
            ErrorDetails::Config { message } => {
                write!(f, "Config error: {message}")
            }
            ErrorDetails::FeatureNotEntitled { message, .. } => {
                write!(f, "{message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::InvalidUrl { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::JsonRequest { message } => {
                write!(f, "Error parsing request body: {message}")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "Observability error: {message}")
            }
            ErrorDetails::QuotaExceeded { .. } => {
                write!(f, "Monthly quota exceeded. Please upgrade your plan.")
            }
            ErrorDetails::RateLimitExceeded { .. } => {
                write!(f, "Rate limit exceeded. Please try again later.")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: `{method} {path}`")
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Error serializing or deserializing: {message}")
            }
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Shared store unavailable: {message}")
            }
            ErrorDetails::SubscriptionExpired => {
                write!(f, "Subscription expired")
            }
            ErrorDetails::UsageAppend { message } => {
                write!(f, "Error appending usage record: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        let body = self.to_response_json();
        let mut response = (self.status_code(), Json(body)).into_response();
        // Rate-limit rejections carry their window headers onto the wire
        if let ErrorDetails::RateLimitExceeded { headers } = self.get_details() {
            response.headers_mut().extend(headers.to_header_map());
        }
        response
    }
}
