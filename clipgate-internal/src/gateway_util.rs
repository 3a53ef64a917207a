use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{rejection::JsonRejection, FromRequest, Json, Request};
use axum::routing::{get, post};
use axum::Router;
use reqwest::redirect;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot::Sender;
use tracing::instrument;

use crate::auth::{require_api_key, Auth, PrincipalStore};
use crate::cache::ExtractionCache;
use crate::config_parser::{Config, ExtractorConfig};
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::extractor::tiktok::{TikTokExtractor, DEFAULT_USER_AGENT};
use crate::extractor::ExtractionRetrier;
use crate::quota::QuotaTracker;
use crate::rate_limit::FixedWindowLimiter;
use crate::store::SharedStore;
use crate::usage::UsageRecorder;

/// Represents the authentication state of the gateway
#[derive(Clone)]
pub enum AuthenticationInfo {
    Enabled(Auth),
    Disabled,
}

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub shared_store: SharedStore,
    pub authentication_info: AuthenticationInfo,
    pub rate_limiter: Arc<FixedWindowLimiter>,
    pub quota_tracker: Arc<QuotaTracker>,
    pub extraction_cache: Arc<ExtractionCache>,
    pub retrier: Arc<ExtractionRetrier>,
    pub usage_recorder: Arc<UsageRecorder>,
}
pub type AppState = axum::extract::State<AppStateData>;

impl AppStateData {
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let redis_url = std::env::var("CLIPGATE_REDIS_URL")
            .ok()
            .map(SecretString::from);
        let shared_store = setup_shared_store(redis_url).await?;
        Self::new_with_store(config, shared_store)
    }

    /// Build the full request pipeline on an already-constructed store.
    /// Every component shares the same store handle, so a single outage is
    /// observed consistently across limiter, quota, cache, and ledger.
    pub fn new_with_store(config: Arc<Config>, shared_store: SharedStore) -> Result<Self, Error> {
        let authentication_info = setup_authentication(&config);
        let principals = match &authentication_info {
            AuthenticationInfo::Enabled(auth) => auth.principals().clone(),
            AuthenticationInfo::Disabled => PrincipalStore::empty(),
        };

        let http_client = setup_http_client(&config.extractor)?;
        let extractor = Arc::new(TikTokExtractor::new(http_client)?);
        let retrier = Arc::new(ExtractionRetrier::new(extractor, &config.extractor));

        let rate_limiter = Arc::new(FixedWindowLimiter::new(shared_store.clone()));
        let quota_tracker = Arc::new(QuotaTracker::new(shared_store.clone(), principals));
        let extraction_cache = Arc::new(ExtractionCache::new(shared_store.clone(), &config.cache));
        let usage_recorder = Arc::new(UsageRecorder::new(shared_store.clone()));

        Ok(Self {
            config,
            shared_store,
            authentication_info,
            rate_limiter,
            quota_tracker,
            extraction_cache,
            retrier,
            usage_recorder,
        })
    }

    /// Replace the retrier. Tests use this to substitute scripted extractors.
    pub fn with_retrier(mut self, retrier: Arc<ExtractionRetrier>) -> Self {
        self.retrier = retrier;
        self
    }
}

/// Connect the shared store from the `CLIPGATE_REDIS_URL` environment
/// variable. Without it the gateway still serves traffic: rate limit and
/// quota checks fail open and responses are never cached.
pub async fn setup_shared_store(redis_url: Option<SecretString>) -> Result<SharedStore, Error> {
    match redis_url {
        Some(url) if !url.expose_secret().is_empty() => {
            let store = SharedStore::new(url.expose_secret()).await?;
            tracing::info!("Connected to shared store");
            Ok(store)
        }
        Some(_) => {
            tracing::warn!(
                "CLIPGATE_REDIS_URL is empty; rate limits and quotas fail open and responses are not cached"
            );
            Ok(SharedStore::new_disabled())
        }
        None => {
            tracing::warn!(
                "CLIPGATE_REDIS_URL is not set; rate limits and quotas fail open and responses are not cached"
            );
            Ok(SharedStore::new_disabled())
        }
    }
}

pub fn setup_authentication(config: &Config) -> AuthenticationInfo {
    match config.auth.enabled {
        Some(false) => {
            tracing::info!("Authentication explicitly disabled via configuration");
            AuthenticationInfo::Disabled
        }
        Some(true) | None => {
            if config.principals.is_empty() && config.auth.enabled == Some(true) {
                tracing::warn!("Authentication enabled but no principals configured");
            }
            AuthenticationInfo::Enabled(Auth::new(
                PrincipalStore::new(config.principal_table()),
                config.auth.key_prefix.clone(),
            ))
        }
    }
}

/// Client for upstream page fetches. The timeout matches the extraction
/// attempt budget; short links need redirects followed.
pub fn setup_http_client(config: &ExtractorConfig) -> Result<Client, Error> {
    Client::builder()
        .user_agent(config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
        .timeout(Duration::from_secs(config.timeout_s))
        .redirect(redirect::Policy::limited(10))
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

/// Assemble the gateway router. The extraction route sits behind the API key
/// middleware; health, status, and the fallback stay public.
pub fn build_router(app_state: AppStateData) -> Router {
    Router::new()
        .route(
            "/api/v1/video/extract",
            post(endpoints::extract::extract_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            require_api_key,
        ))
        .route("/health", get(endpoints::status::health_handler))
        .route("/status", get(endpoints::status::status_handler))
        .fallback(endpoints::fallback::handle_404)
        .with_state(app_state)
}

/// Custom Axum extractor that validates the JSON body and deserializes it into a custom type
///
/// When this extractor is present, we don't check if the `Content-Type` header is `application/json`,
/// and instead simply assume that the request body is a JSON object.
pub struct StructuredJson<T>(pub T);

impl<S, T> FromRequest<S> for StructuredJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Send + Sync + DeserializeOwned,
{
    type Rejection = Error;

    #[instrument(skip_all, level = "trace", name = "StructuredJson::from_request")]
    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        // Retrieve the request body as Bytes before deserializing it
        let bytes = bytes::Bytes::from_request(req, state).await.map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: format!("{} ({})", e, e.status()),
            })
        })?;

        // Convert the entire body into `serde_json::Value`
        let value = Json::<serde_json::Value>::from_bytes(&bytes)
            .map_err(|e| {
                Error::new(ErrorDetails::JsonRequest {
                    message: format!("{} ({})", e, e.status()),
                })
            })?
            .0;

        // Now use `serde_path_to_error::deserialize` to attempt deserialization into `T`
        let deserialized: T = serde_path_to_error::deserialize(&value).map_err(|e| {
            Error::new(ErrorDetails::JsonRequest {
                message: e.to_string(),
            })
        })?;

        Ok(StructuredJson(deserialized))
    }
}

pub struct ShutdownHandle {
    #[expect(dead_code)]
    sender: Sender<()>,
}

/// Starts a gateway on an unused local port, for embedding in tests and
/// host processes.
///
/// Returns the address the gateway is listening on, and a `ShutdownHandle`
/// which shuts down the gateway when dropped.
pub async fn start_embedded_gateway(
    config_file: Option<String>,
    redis_url: Option<SecretString>,
) -> Result<(SocketAddr, ShutdownHandle), Error> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Failed to bind to a port: {e}"),
            })
        })?;
    let bind_addr = listener.local_addr().map_err(|e| {
        Error::new(ErrorDetails::InternalError {
            message: format!("Failed to get local address: {e}"),
        })
    })?;

    let config = if let Some(config_file) = config_file {
        Arc::new(Config::load_from_path(Path::new(&config_file))?)
    } else {
        Arc::new(Config::default())
    };
    let shared_store = setup_shared_store(redis_url).await?;
    let app_state = AppStateData::new_with_store(config, shared_store)?;
    let router = build_router(app_state);

    let (sender, recv) = tokio::sync::oneshot::channel::<()>();
    let shutdown_fut = async move {
        let _ = recv.await;
    };

    tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_fut)
            .into_future(),
    );
    Ok((bind_addr, ShutdownHandle { sender }))
}
