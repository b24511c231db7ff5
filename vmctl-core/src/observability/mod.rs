//! Observability: tracing, Prometheus metrics and health checks.
//!
//! Call [`init`] once at process start, before the driver is opened.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod health;
pub mod metrics;

/// OTLP export is on when `VMCTL_OTLP_ENABLED` or `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
#[cfg(feature = "otlp")]
fn otlp_enabled() -> bool {
    std::env::var("VMCTL_OTLP_ENABLED").is_ok()
        || std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

#[cfg(feature = "otlp")]
fn otlp_tracer() -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
    use opentelemetry_sdk::Resource;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(&endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    opentelemetry::KeyValue::new("service.name", "vmctld"),
                    opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;
    Ok(tracer)
}

/// Install the global tracing subscriber and, when `metrics_port` is given,
/// the Prometheus exporter.
///
/// `RUST_LOG` takes precedence over `log_level`. Fails if a global
/// subscriber is already installed.
pub fn init(log_level: &str, metrics_port: Option<u16>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true));

    #[cfg(feature = "otlp")]
    {
        if otlp_enabled() {
            let telemetry = tracing_opentelemetry::layer().with_tracer(otlp_tracer()?);
            subscriber.with(telemetry).try_init()?;
            tracing::info!("Observability initialized with OTLP tracing");
            return install_metrics(metrics_port);
        }
    }

    subscriber.try_init()?;
    tracing::info!("Observability initialized");
    install_metrics(metrics_port)
}

fn install_metrics(metrics_port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "Prometheus exporter listening");
    }
    metrics::register_core_metrics();
    Ok(())
}

/// Flush pending spans.
pub fn shutdown() {
    #[cfg(feature = "otlp")]
    opentelemetry::global::shutdown_tracer_provider();
}
