//! Logging and metrics bootstrap for the gateway binary.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Registry};

use crate::error::{Error, ErrorDetails};

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[clap(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Handles for log settings that depend on the config file. Logging comes up
/// before the config is parsed, so `gateway.debug` is applied through a
/// filter reload once the config has been read.
pub struct DelayedLogConfig {
    pub delayed_debug_logs: DelayedDebugLogs,
}

pub struct DelayedDebugLogs {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl DelayedDebugLogs {
    pub fn enable_debug(&self) -> Result<(), Error> {
        self.handle
            .reload(build_env_filter(true))
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Failed to enable debug logs: {e}"),
                })
            })
    }
}

/// `RUST_LOG` takes precedence over everything, including `gateway.debug`.
fn build_env_filter(debug: bool) -> EnvFilter {
    let default_directives = if debug {
        "warn,gateway=debug,clipgate_internal=debug"
    } else {
        "warn,gateway=info,clipgate_internal=info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}

/// Install the global tracing subscriber. Called once, at the very top of
/// `main`, so that everything after it can log.
pub fn setup_observability(log_format: LogFormat) -> Result<DelayedLogConfig, Error> {
    let (env_filter, env_filter_handle) = reload::Layer::new(build_env_filter(false));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to initialize tracing: {e}"),
        })
    })?;

    Ok(DelayedLogConfig {
        delayed_debug_logs: DelayedDebugLogs {
            handle: env_filter_handle,
        },
    })
}

/// Install the Prometheus recorder. The returned handle renders the scrape
/// body for the `/metrics` route.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus metrics recorder: {e}"),
        })
    })
}
