//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{ACQUIRE_TOTAL, LISTEN_TOTAL};
use crate::pool::AcquireError;

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording pool metrics
pub struct PoolMetrics;

impl PoolMetrics {
    /// Record the result of an acquire call
    pub fn record_acquire<T>(result: &Result<T, AcquireError>) {
        let label = match result {
            Ok(_) => "ok",
            Err(AcquireError::Cancelled) => "cancelled",
            Err(AcquireError::DeadlineExceeded) => "deadline",
            Err(AcquireError::PoolClosed) => "closed",
            Err(AcquireError::Connect(_)) => "connect_error",
        };
        ACQUIRE_TOTAL.with_label_values(&[label]).inc();
    }
}

/// Helper struct for recording listener metrics
pub struct ListenMetrics;

impl ListenMetrics {
    /// Record a listen cycle that ended in `outcome`
    pub fn record_outcome(outcome: &str) {
        LISTEN_TOTAL.with_label_values(&[outcome]).inc();
    }
}
