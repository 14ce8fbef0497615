use std::time::Duration;

use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceTransport {
    Grpc,
    Http,
}

impl TraceTransport {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "otlp_grpc" | "otlp-grpc" => Some(Self::Grpc),
            "otlp_http" | "otlp-http" => Some(Self::Http),
            _ => None,
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::Grpc => "http://127.0.0.1:4317",
            Self::Http => "http://127.0.0.1:4318/v1/traces",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSink {
    pub transport: TraceTransport,
    pub endpoint: String,
}

pub fn parse_http_protocol(raw: &str) -> Protocol {
    if raw.trim().eq_ignore_ascii_case("json") { Protocol::HttpJson } else { Protocol::HttpBinary }
}

/// Parses `<otlp_grpc|otlp_http>=<endpoint>` entries separated by commas.
/// Bad entries are returned as messages instead of failing the whole list.
pub fn parse_trace_sinks(raw: &str) -> (Vec<TraceSink>, Vec<String>) {
    let mut sinks = Vec::new();
    let mut rejected = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let parsed = entry
            .split_once('=')
            .ok_or_else(|| format!("'{entry}' has no '='"))
            .and_then(|(transport, endpoint)| {
                let transport = TraceTransport::parse(transport)
                    .ok_or_else(|| format!("unknown transport '{transport}'"))?;
                let endpoint = endpoint.trim();
                if endpoint.is_empty() {
                    return Err(format!("'{entry}' has an empty endpoint"));
                }
                Ok(TraceSink { transport, endpoint: endpoint.to_string() })
            });
        match parsed {
            Ok(sink) => sinks.push(sink),
            Err(reason) => rejected.push(reason),
        }
    }
    (sinks, rejected)
}

/// Builds one exporter per sink. Sinks that fail to build are reported on
/// stderr and skipped; tracing never blocks start-up.
pub fn build_exporters(
    sinks: &[TraceSink],
    timeout: Duration,
    http_protocol: Protocol,
) -> Vec<SpanExporter> {
    sinks
        .iter()
        .filter_map(|sink| {
            let built = match sink.transport {
                TraceTransport::Grpc => SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(sink.endpoint.clone())
                    .with_timeout(timeout)
                    .build(),
                TraceTransport::Http => SpanExporter::builder()
                    .with_http()
                    .with_endpoint(sink.endpoint.clone())
                    .with_timeout(timeout)
                    .with_protocol(http_protocol)
                    .build(),
            };
            built
                .inspect_err(|error| {
                    eprintln!(
                        "kbgate: skipping trace exporter {} ({:?}): {error}",
                        sink.endpoint, sink.transport
                    );
                })
                .ok()
        })
        .collect()
}
