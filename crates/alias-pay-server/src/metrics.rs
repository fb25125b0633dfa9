use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::sync::LazyLock;

pub static CHECKOUT_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "alias_pay_checkout_total",
        "Checkout requests by result",
        &["result"]
    )
    .unwrap()
});

pub static CONFIRM_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "alias_pay_confirm_total",
        "Confirmation requests by reported status",
        &["status"]
    )
    .unwrap()
});

pub static CONFIRM_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "alias_pay_confirm_wait_seconds",
        "Time spent answering a confirmation request",
        &["status"],
        vec![0.01, 0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]
    )
    .unwrap()
});

pub static RELAY_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "alias_pay_relay_events_total",
        "Relay events received on the ingestion endpoint",
        &["result"]
    )
    .unwrap()
});

pub static HMAC_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "alias_pay_hmac_failures_total",
        "Relay signature failures",
        &["reason"]
    )
    .unwrap()
});

pub fn metrics_output() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
