//! Metrics / Tracing hooks (C9): counters and a histogram around
//! dispatch, merge, retry, and backpressure, under the `langgraph_`
//! namespace. Built on the `metrics` facade crate so the exporter behind
//! it (Prometheus, statsd, or none) is a deployment choice, not a
//! compile-time one.

use metrics::{counter, gauge, histogram};

pub fn set_inflight_nodes(value: f64) {
    gauge!("langgraph_inflight_nodes").set(value);
}

pub fn set_queue_depth(value: f64) {
    gauge!("langgraph_queue_depth").set(value);
}

pub fn record_step_latency_ms(ms: f64) {
    histogram!("langgraph_step_latency_ms").record(ms);
}

pub fn inc_retries() {
    counter!("langgraph_retries_total").increment(1);
}

pub fn inc_merge_conflicts() {
    counter!("langgraph_merge_conflicts_total").increment(1);
}

pub fn inc_backpressure_events() {
    counter!("langgraph_backpressure_events_total").increment(1);
}

/// Installs the process-wide Prometheus recorder. Call once, typically
/// from the CLI binary's `main`; library embedders may install their own
/// recorder instead and these helpers will record against it transparently.
#[cfg(feature = "metrics-prometheus-exporter")]
pub fn install_prometheus_recorder() {
    metrics_prometheus::install();
}
