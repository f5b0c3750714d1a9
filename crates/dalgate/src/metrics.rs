//! Aggregate gateway metrics
//!
//! The gateway records query counters and a running average response time;
//! everything else in [`DalMetrics`] is assembled on demand from breaker and
//! queue snapshots.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::breaker::BreakerSnapshot;
use crate::queue::QueueMetrics;
use crate::types::ConnectorMetadata;

/// Point-in-time metrics for one gateway.
#[derive(Debug, Clone, Serialize)]
pub struct DalMetrics {
    /// Statements routed through `query` and `execute`
    pub total_operations: u64,
    /// Operations that failed on every attempted connector (queued writes
    /// included)
    pub failed_operations: u64,
    /// Running average round-trip time across successful queries
    pub avg_response_time: Duration,
    /// Currently active connector id
    pub active_connector: Option<String>,
    /// Registered connector count
    pub registered_connectors: usize,
    /// Breaker snapshot per connector id
    pub breakers: HashMap<String, BreakerSnapshot>,
    /// When the health-check loop last completed a sweep
    pub last_health_check: Option<DateTime<Utc>>,
    /// Sync queue summary
    pub queue: QueueSummary,
}

/// Sync-queue figures surfaced through [`DalMetrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSummary {
    /// Items currently pending replay
    pub pending: usize,
    /// Lifetime counters
    #[serde(flatten)]
    pub metrics: QueueMetrics,
}

/// Per-connector status line for operational dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatusReport {
    /// Connector id
    pub id: String,
    /// Display name
    pub name: String,
    /// Store kind and masked locator
    pub metadata: ConnectorMetadata,
    /// Whether this connector is the active one
    pub active: bool,
    /// Whether the connector may be auto-activated
    pub enabled: bool,
    /// Activation priority (lower preferred)
    pub priority: i32,
    /// Last-known connection flag
    pub connected: bool,
    /// Breaker snapshot
    pub breaker: BreakerSnapshot,
}

/// Lock-light operation counters with a running average.
///
/// The average uses the incremental form `avg += (x - avg) / n`, so no
/// history is kept.
#[derive(Debug, Default)]
pub(crate) struct OperationStats {
    total: AtomicU64,
    failed: AtomicU64,
    avg_micros: Mutex<f64>,
}

impl OperationStats {
    pub(crate) fn record_success(&self, response_time: Duration) {
        let n = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let mut avg = self.avg_micros.lock();
        *avg += (response_time.as_secs_f64() * 1_000_000.0 - *avg) / n as f64;
    }

    pub(crate) fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn average(&self) -> Duration {
        Duration::from_micros(*self.avg_micros.lock() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let stats = OperationStats::default();
        stats.record_success(Duration::from_millis(10));
        stats.record_success(Duration::from_millis(20));
        stats.record_success(Duration::from_millis(30));

        assert_eq!(stats.total(), 3);
        assert_eq!(stats.failed(), 0);
        let avg = stats.average();
        assert!(avg >= Duration::from_millis(19) && avg <= Duration::from_millis(21));
    }

    #[test]
    fn test_failures_counted_in_total() {
        let stats = OperationStats::default();
        stats.record_success(Duration::from_millis(5));
        stats.record_failure();

        assert_eq!(stats.total(), 2);
        assert_eq!(stats.failed(), 1);
        // Failures do not disturb the average
        assert_eq!(stats.average(), Duration::from_millis(5));
    }
}
