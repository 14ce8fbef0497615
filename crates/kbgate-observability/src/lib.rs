//! Process-wide `tracing` setup: env-filtered compact logs on stdout plus
//! optional OTLP span export.

mod config;
pub mod exporters;

pub use config::ObservabilityConfig;

use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::exporters::{otlp::build_exporters, stdout::LogOutput, stdout::span_events};

const APP_CRATES: [&str; 4] = ["kbgate_app", "kbgate_core", "kbgate_upstream", "kbgate_observability"];

/// Keeps the span exporters alive; flushes them when dropped.
#[derive(Debug, Default)]
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(error) = provider.shutdown()
        {
            eprintln!("kbgate: trace provider shutdown failed: {error}");
        }
    }
}

pub fn env_filter(log_level: &str) -> EnvFilter {
    let directives = std::iter::once(log_level.to_string())
        .chain(APP_CRATES.iter().map(|name| format!("{name}={log_level}")))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_tracing(service_name: &str, config: &ObservabilityConfig) -> TracingGuard {
    let fmt_layer = (config.log_output == LogOutput::Stdout).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stdout)
            .with_span_events(span_events(config.log_span_events))
    });

    let provider = config.trace_enabled.then(|| tracer_provider(service_name, config)).flatten();
    let telemetry_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()))
    });
    if let Some(provider) = provider.as_ref() {
        global::set_tracer_provider(provider.clone());
    }

    tracing_subscriber::registry()
        .with(env_filter(&config.log_level))
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()
        .ok();

    TracingGuard { provider }
}

fn tracer_provider(service_name: &str, config: &ObservabilityConfig) -> Option<SdkTracerProvider> {
    let exporters =
        build_exporters(&config.trace_sinks, config.trace_timeout, config.trace_http_protocol);
    if exporters.is_empty() {
        return None;
    }
    let resource = Resource::builder().with_service_name(service_name.to_string()).build();
    let builder = exporters.into_iter().fold(
        SdkTracerProvider::builder().with_resource(resource),
        |builder, exporter| builder.with_batch_exporter(exporter),
    );
    Some(builder.build())
}
