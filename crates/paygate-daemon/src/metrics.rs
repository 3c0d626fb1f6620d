use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};
use std::sync::LazyLock;

pub use paygate::metrics::metrics_output;

pub static API_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_api_requests_total",
        "HTTP API requests",
        &["route", "result"]
    )
    .unwrap()
});

pub static CREATE_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "paygate_api_create_duration_seconds",
        "Payment creation latency in seconds",
        &["result"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap()
});

pub static METRICS_AUTH_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_metrics_auth_failures_total",
        "Rejected /metrics requests",
        &["reason"]
    )
    .unwrap()
});
