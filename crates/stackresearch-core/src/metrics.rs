use anyhow::Result;
use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct ResearchMetrics {
    model_calls: Counter<u64>,
    model_latency_ms: Histogram<f64>,
    searches: Counter<u64>,
    search_failures: Counter<u64>,
    reflections: Counter<u64>,
}

static METRICS: OnceCell<ResearchMetrics> = OnceCell::new();

fn handles() -> &'static ResearchMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("stackresearch.agent");
        ResearchMetrics {
            model_calls: meter
                .u64_counter("model_calls_total")
                .with_description("Total model invocations by call kind and status")
                .init(),
            model_latency_ms: meter
                .f64_histogram("model_latency_ms")
                .with_description("Model round-trip latency in milliseconds")
                .init(),
            searches: meter
                .u64_counter("search_queries_total")
                .with_description("Total web searches issued")
                .init(),
            search_failures: meter
                .u64_counter("search_round_failures_total")
                .with_description("Research rounds that fell back to offline notes")
                .init(),
            reflections: meter
                .u64_counter("reflections_total")
                .with_description("Reflection verdicts by outcome")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) -> Result<()> {
    if std::env::var("STACKRESEARCH_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "STACKRESEARCH_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export agent metrics."
        );
    }
    Ok(())
}

pub(crate) fn record_model_call(kind: &'static str, ok: bool, latency_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("kind", kind),
        KeyValue::new("status", if ok { "ok" } else { "error" }),
    ];
    metrics.model_calls.add(1, &attrs);
    metrics.model_latency_ms.record(latency_ms as f64, &attrs);
}

pub(crate) fn record_search_round(queries: usize, failed: bool) {
    let metrics = handles();
    metrics.searches.add(queries as u64, &[]);
    if failed {
        metrics.search_failures.add(1, &[]);
    }
}

pub(crate) fn record_reflection(satisfactory: bool) {
    handles().reflections.add(
        1,
        &[KeyValue::new(
            "outcome",
            if satisfactory { "satisfactory" } else { "gaps" },
        )],
    );
}
