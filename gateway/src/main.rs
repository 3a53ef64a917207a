use axum::extract::{DefaultBodyLimit, Request};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get;
use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use clipgate_internal::config_parser::Config;
use clipgate_internal::endpoints::status::CLIPGATE_VERSION;
use clipgate_internal::error;
use clipgate_internal::gateway_util::{self, AuthenticationInfo};
use clipgate_internal::observability::{self, LogFormat};
use clipgate_internal::redis_client::RedisClient;
use clipgate_internal::store::SharedStore;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Requests to this gateway are small JSON documents; anything bigger than
/// this is not a legitimate extraction request.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Soft threshold for the slow-response warning. Extraction with retries can
/// legitimately run long, so this logs rather than aborts.
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `clipgate.toml` config file at the specified path
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

async fn add_version_header(request: Request, next: Next) -> Response {
    let version = HeaderValue::from_static(CLIPGATE_VERSION);
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("x-clipgate-gateway-version", version);
    response
}

/// Stamp every response with its wall-clock handling time and warn about
/// responses that crossed the slow threshold.
async fn track_process_time(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;

    let elapsed = started.elapsed();
    if elapsed > SLOW_REQUEST_THRESHOLD {
        tracing::warn!(
            %method,
            path,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow response",
        );
    }
    if let Ok(value) = HeaderValue::from_str(&elapsed.as_millis().to_string()) {
        response.headers_mut().insert("x-process-time", value);
    }
    response
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs and metrics immediately, so that we can use `tracing`
    let delayed_log_config =
        observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting Clipgate {CLIPGATE_VERSION}");

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    let config = if let Some(path) = &args.config_file {
        Arc::new(
            Config::load_from_path(Path::new(&path))
                .ok() // Don't print the error here, since it was already printed when it was constructed
                .expect_pretty("Failed to load config"),
        )
    } else {
        tracing::warn!("No config file provided, so authentication and plan limits use built-in defaults. Use `--config-file path/to/clipgate.toml` to specify a config file.");
        Arc::new(Config::default())
    };

    if config.gateway.debug {
        delayed_log_config
            .delayed_debug_logs
            .enable_debug()
            .expect_pretty("Failed to enable debug logs");
    }

    // Set debug mode
    error::set_debug(config.gateway.debug).expect_pretty("Failed to set debug mode");

    // Initialize AppState
    let app_state = gateway_util::AppStateData::new(config.clone())
        .await
        .expect_pretty("Failed to initialize AppState");

    // Keep the principal table synchronized with the shared store. Only
    // meaningful when both authentication and the store are live.
    if let AuthenticationInfo::Enabled(auth) = &app_state.authentication_info {
        let redis_url = std::env::var("CLIPGATE_REDIS_URL")
            .ok()
            .filter(|url| !url.is_empty());
        if let Some(redis_url) = redis_url {
            RedisClient::new(&redis_url, auth.clone())
                .await
                .expect_pretty("Failed to connect the principal sync client")
                .start()
                .await
                .expect_pretty("Failed to start the principal sync client");
        }
    }

    let store_enabled_pretty = match &app_state.shared_store {
        SharedStore::Disabled => "disabled",
        SharedStore::Mock(_) => "mocked",
        SharedStore::Production { .. } => "enabled",
    };

    let authentication_enabled_pretty = match &app_state.authentication_info {
        AuthenticationInfo::Disabled => "disabled",
        AuthenticationInfo::Enabled(_) => "enabled",
    };

    // Note: In Axum, middleware layers run in REVERSE order of application
    let router = gateway_util::build_router(app_state)
        .route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        )
        .layer(axum::middleware::from_fn(add_version_header))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(axum::middleware::from_fn(track_process_time))
        // We log failed requests at 'DEBUG', since we already have our own error-logging code
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)));

    // Bind to the socket address specified in the config, or default to 0.0.0.0:3000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    let config_path_pretty = if let Some(path) = &args.config_file {
        format!("config file `{}`", path.to_string_lossy())
    } else {
        "no config file".to_string()
    };

    tracing::info!(
        "Clipgate is listening on {actual_bind_address} with {config_path_pretty}, shared store {store_enabled_pretty}, and authentication {authentication_enabled_pretty}.",
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let hangup = async {
        signal::unix::signal(signal::unix::SignalKind::hangup())
            .expect_pretty("Failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
        _ = hangup => {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            tracing::info!("Received SIGHUP signal");
        }
    };
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// We use `expect_pretty` for better DX when handling errors in main.rs.
/// `expect_pretty` will print an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
