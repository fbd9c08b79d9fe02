//! Prometheus Metrics for cshash
//!
//! - Ring operations (add/remove node, lookup, key assignment)
//! - Migration tasks, including the failures that never reach the caller

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, TextEncoder, register_histogram_vec,
    register_int_counter, register_int_counter_vec,
};

lazy_static! {
    /// Total ring operations by type and outcome
    pub static ref RING_OPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cshash_ring_operations_total",
        "Total number of ring operations by type",
        &["operation", "status"]
    ).unwrap();

    /// Ring operation latency in seconds, lock wait included
    pub static ref RING_OP_DURATION: HistogramVec = register_histogram_vec!(
        "cshash_ring_operation_duration_seconds",
        "Ring operation latency in seconds",
        &["operation"],
        vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]
    ).unwrap();

    /// Migration tasks handed to the migrator, by outcome
    pub static ref MIGRATION_TASKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cshash_migration_tasks_total",
        "Total number of migration tasks by outcome",
        &["status"]
    ).unwrap();

    /// Keys whose ownership record moved between real nodes
    pub static ref MIGRATED_KEYS_TOTAL: IntCounter = register_int_counter!(
        "cshash_migrated_keys_total",
        "Total number of keys moved between real nodes"
    ).unwrap();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record ring operation
pub fn record_ring_op(operation: &str, status: &str, duration_secs: f64) {
    RING_OPS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    RING_OP_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record one migration task; only the keys of successful tasks count as moved
pub fn record_migration_task(status: &str, keys: usize) {
    MIGRATION_TASKS_TOTAL.with_label_values(&[status]).inc();
    if status == "success" {
        MIGRATED_KEYS_TOTAL.inc_by(keys as u64);
    }
}
