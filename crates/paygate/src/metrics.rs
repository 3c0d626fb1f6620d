use prometheus::{
    register_gauge, register_int_counter_vec, Encoder, Gauge, IntCounterVec, TextEncoder,
};
use std::sync::LazyLock;

pub static PAYMENTS_CREATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_payments_created_total",
        "Payment creation attempts",
        &["result"]
    )
    .unwrap()
});

pub static RECONCILE_CYCLES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_reconcile_cycles_total",
        "Reconciliation cycles run by the monitor",
        &["result"]
    )
    .unwrap()
});

pub static PAYMENT_CHECKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_payment_checks_total",
        "Per-currency balance/confirmation checks",
        &["currency", "result"]
    )
    .unwrap()
});

pub static PAYMENT_TRANSITIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "paygate_payment_transitions_total",
        "Payments leaving the pending state",
        &["status"]
    )
    .unwrap()
});

pub static POLL_INTERVAL: LazyLock<Gauge> = LazyLock::new(|| {
    register_gauge!(
        "paygate_poll_interval_seconds",
        "Delay before the next reconciliation cycle"
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
