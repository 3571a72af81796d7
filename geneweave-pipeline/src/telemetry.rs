//! Tracing subscriber initialization.

use crate::error::{PipelineError, PipelineResult};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "geneweave=info,info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    pub log_format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "geneweave".to_string(),
            log_format: LogFormat::Pretty,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// - `GENEWEAVE_SERVICE_NAME` (default: "geneweave")
    /// - `GENEWEAVE_LOG_FORMAT`: `json` or `pretty` (default: pretty)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("GENEWEAVE_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_format: std::env::var("GENEWEAVE_LOG_FORMAT")
                .map(|s| parse_log_format(&s))
                .unwrap_or(defaults.log_format),
            default_filter: defaults.default_filter,
        }
    }
}

fn parse_log_format(raw: &str) -> LogFormat {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

/// The fmt layer for `format`, writing to `writer`.
fn fmt_layer<S, W>(format: LogFormat, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_writer(writer).boxed(),
    }
}

/// Install the global subscriber. Call once at startup.
///
/// Logs go to stderr in both formats; stdout carries command output only.
pub fn init_tracing(config: &TelemetryConfig) -> PipelineResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer(config.log_format, std::io::stderr))
        .try_init()
        .map_err(|e| PipelineError::Telemetry {
            reason: format!("Failed to init subscriber: {}", e),
        })?;

    tracing::debug!(
        service_name = %config.service_name,
        format = ?config.log_format,
        "Telemetry initialized"
    );
    Ok(())
}
