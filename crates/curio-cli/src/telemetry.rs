//! Tracing pipeline for the `curio` binary.
//!
//! [`init_tracing`] installs one `tracing` subscriber per process: an
//! [`EnvFilter`], a console formatter and, when a collector is configured, an
//! OTLP/HTTP span exporter.  Spans carry the `#[instrument]` fields emitted
//! while extractors and curiosity modules are built, plus the `pretrain`
//! run span with its `run_id`.
//!
//! Exported spans are tagged with `service.name = "curio"`,
//! `service.version` and `curio.command` (`pretrain`, `inspect`, …) so runs
//! of different subcommands can be told apart in the collector.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` | Full traces URL; wins over the base endpoint. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Collector base URL (e.g. `http://localhost:4318`); `/v1/traces` is appended. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `CURIO_LOG_FORMAT` | `json` for newline-delimited JSON, otherwise compact text. |

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "curio";
const DEFAULT_FILTER: &str = "info";
const TRACES_PATH: &str = "/v1/traces";

/// Console log rendering, from `CURIO_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    fn from_env() -> Self {
        Self::parse(std::env::var("CURIO_LOG_FORMAT").ok().as_deref())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Install the global subscriber for a run of `command`.
///
/// The returned [`TracerProviderGuard`] must live until the process exits;
/// dropping it flushes pending spans.
pub fn init_tracing(command: &str) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = LogFormat::from_env();
    let provider = build_provider(command);

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(SERVICE_NAME)));
    let json_layer = (format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json());
    let compact_layer =
        (format == LogFormat::Compact).then(|| tracing_subscriber::fmt::layer().compact());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json_layer)
        .with(compact_layer)
        .init();

    TracerProviderGuard(provider)
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII guard
// ─────────────────────────────────────────────────────────────────────────────

/// Shuts down the OTel [`SdkTracerProvider`] on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[curio] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Traces URL from the per-signal variable, else the base endpoint plus
/// [`TRACES_PATH`].
fn traces_endpoint(traces: Option<String>, base: Option<String>) -> Option<String> {
    if let Some(url) = traces.filter(|u| !u.trim().is_empty()) {
        return Some(url);
    }
    let base = base.filter(|u| !u.trim().is_empty())?;
    let base = base.trim_end_matches('/');
    if base.ends_with(TRACES_PATH) {
        Some(base.to_string())
    } else {
        Some(format!("{base}{TRACES_PATH}"))
    }
}

fn resource(command: &str) -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("curio.command", command.to_string()),
        ])
        .build()
}

/// `None` when no endpoint is configured or the exporter cannot be built.
fn build_provider(command: &str) -> Option<SdkTracerProvider> {
    let endpoint = traces_endpoint(
        std::env::var("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT").ok(),
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
    )?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[curio] OTLP exporter init failed: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource(command))
            // The binary has no async runtime to drive a batch exporter.
            .with_simple_exporter(exporter)
            .build(),
    )
}
