//! Prometheus self-metrics for the agent

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};

pub static CYCLES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("vigil_cycles_total", "Merge-and-forward cycles completed").unwrap()
});

pub static FORWARD_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("vigil_forward_total", "Forward attempts by outcome", &["status"]).unwrap()
});

pub static FORWARD_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "vigil_forward_duration_seconds",
        "Forward request latency",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap()
});

pub static AGGREGATION_FAILURES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_aggregation_failures_total",
        "Cycles forwarded without derived metrics"
    )
    .unwrap()
});

pub static GENERATION: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("vigil_generation", "Pipeline generations started").unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
