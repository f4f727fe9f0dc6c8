//! Log subscriber setup. Logs always go to stderr; spans are exported to
//! Jaeger only when a collector endpoint is configured.

use std::env;
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::trace::TraceError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "ocrjobs=debug";

const SERVICE_NAME: &str = "ocrjobs";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(2);

pub fn init(jaeger_endpoint: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let otel_layer = jaeger_endpoint
        .map(jaeger_tracer)
        .transpose()?
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(filter()?)
        .with(fmt::Layer::default().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

pub fn shutdown() {
    global::shutdown_tracer_provider();
}

fn filter() -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
}

fn jaeger_tracer(endpoint: &str) -> Result<Tracer, TraceError> {
    // The isahc collector client would route through these.
    for var in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"] {
        env::remove_var(var);
    }

    global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());

    opentelemetry_jaeger::new_collector_pipeline()
        .with_endpoint(endpoint)
        .with_service_name(SERVICE_NAME)
        .with_isahc()
        .with_timeout(EXPORT_TIMEOUT)
        .install_batch(opentelemetry::runtime::Tokio)
}
