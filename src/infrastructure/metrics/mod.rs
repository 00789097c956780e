//! Prometheus metrics for the pool and the listener.
//!
//! - Pool metrics (open connections, leased connections, acquire results)
//! - Listen outcomes
//! - Forwarded server notices

mod helpers;

pub use helpers::{encode_metrics, ListenMetrics, PoolMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "pgwait";

lazy_static! {
    /// Open physical connections across all pools
    pub static ref POOL_CONNECTIONS: IntGauge = register_int_gauge!(
        format!("{}_pool_connections", METRIC_PREFIX),
        "Number of open pooled connections"
    ).unwrap();

    /// Connections currently leased to callers
    pub static ref POOL_IN_USE: IntGauge = register_int_gauge!(
        format!("{}_pool_in_use", METRIC_PREFIX),
        "Number of pooled connections currently leased"
    ).unwrap();

    /// Acquire attempts by result
    pub static ref ACQUIRE_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_acquire_total", METRIC_PREFIX),
        "Connection acquire attempts by result",
        &["result"]
    ).unwrap();

    /// Listen cycles by terminal outcome
    pub static ref LISTEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_listen_total", METRIC_PREFIX),
        "Listen cycles by outcome",
        &["outcome"]
    ).unwrap();

    /// Server notices forwarded to the log
    pub static ref NOTICES_FORWARDED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_notices_forwarded_total", METRIC_PREFIX),
        "Server notices forwarded as warnings"
    ).unwrap();
}
