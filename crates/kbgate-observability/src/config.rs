use std::{env, time::Duration};

use opentelemetry_otlp::Protocol;

use crate::exporters::{
    otlp::{TraceSink, TraceTransport, parse_http_protocol, parse_trace_sinks},
    stdout::LogOutput,
};

const DEFAULT_TRACE_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_span_events: bool,
    pub log_output: LogOutput,
    pub trace_enabled: bool,
    pub trace_http_protocol: Protocol,
    pub trace_timeout: Duration,
    pub trace_sinks: Vec<TraceSink>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_span_events: false,
            log_output: LogOutput::Stdout,
            trace_enabled: false,
            trace_http_protocol: Protocol::HttpBinary,
            trace_timeout: Duration::from_millis(DEFAULT_TRACE_TIMEOUT_MS),
            trace_sinks: Vec::new(),
        }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let trace_enabled = env_truthy("KB_TRACE_ENABLED");
        Self {
            log_level: env::var("KB_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_span_events: env_truthy("KB_LOG_SPAN_EVENTS"),
            log_output: env::var("KB_LOG_EXPORTER")
                .map(|raw| LogOutput::parse(&raw))
                .unwrap_or(defaults.log_output),
            trace_enabled,
            trace_http_protocol: env::var("KB_OTEL_TRACE_HTTP_PROTOCOL")
                .map(|raw| parse_http_protocol(&raw))
                .unwrap_or(defaults.trace_http_protocol),
            trace_timeout: env::var("KB_OTEL_TRACE_TIMEOUT_MS")
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.trace_timeout),
            trace_sinks: if trace_enabled { trace_sinks_from_env() } else { Vec::new() },
        }
    }
}

fn trace_sinks_from_env() -> Vec<TraceSink> {
    let raw = env::var("KB_OTEL_TRACE_EXPORTERS").unwrap_or_default();
    let (sinks, rejected) = parse_trace_sinks(&raw);
    for reason in rejected {
        eprintln!("kbgate: ignoring KB_OTEL_TRACE_EXPORTERS entry: {reason}");
    }
    if sinks.is_empty() {
        let transport = TraceTransport::Grpc;
        return vec![TraceSink { transport, endpoint: transport.default_endpoint().to_string() }];
    }
    sinks
}

fn env_truthy(name: &str) -> bool {
    env::var(name).is_ok_and(|value| {
        matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}
