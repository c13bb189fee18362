//! Metrics module
//!
//! Prometheus counters for the transaction engine itself. Registered in the
//! default registry and served by [`server::MetricsServer`].

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Histogram,
};

lazy_static! {
    // Transaction metrics
    pub static ref TRANSACTIONS_STARTED: Counter = register_counter!(
        "reqtrace_transactions_started_total",
        "Transactions started"
    ).unwrap();

    pub static ref TRANSACTIONS_ENDED: CounterVec = register_counter_vec!(
        "reqtrace_transactions_ended_total",
        "Transactions ended and handed to the reporter",
        &["outcome"]
    ).unwrap();

    pub static ref TRANSACTIONS_DECLINED: CounterVec = register_counter_vec!(
        "reqtrace_transactions_declined_total",
        "Requests the tracer declined to start a transaction for",
        &["reason"]  // "disabled", "ignored_url" or "sampler"
    ).unwrap();

    pub static ref TRANSACTION_DURATION: Histogram = register_histogram!(
        "reqtrace_transaction_duration_seconds",
        "Transaction duration in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    // Recoverable anomalies
    pub static ref ANOMALIES_TOTAL: CounterVec = register_counter_vec!(
        "reqtrace_anomalies_total",
        "Recoverable anomalies observed by the engine",
        &["kind"]
    ).unwrap();
}

/// Record a started transaction
pub fn record_transaction_started() {
    TRANSACTIONS_STARTED.inc();
}

/// Record an ended transaction
pub fn record_transaction_ended(outcome: &str, duration_secs: f64) {
    TRANSACTIONS_ENDED.with_label_values(&[outcome]).inc();
    TRANSACTION_DURATION.observe(duration_secs);
}

/// Record a request that got no transaction
pub fn record_transaction_declined(reason: &str) {
    TRANSACTIONS_DECLINED.with_label_values(&[reason]).inc();
}

/// Record a recoverable anomaly
///
/// Kinds: `duplicate_finish`, `no_outcome`, `finalizer_panic`,
/// `abandoned_flow`, `discarded`.
pub fn record_anomaly(kind: &str) {
    ANOMALIES_TOTAL.with_label_values(&[kind]).inc();
}
