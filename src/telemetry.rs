//! Executor metrics and correlation ids.
//!
//! Counters are plain atomics updated on the hot path with relaxed ordering;
//! [`ExecutorMetrics::snapshot`] gives a consistent-enough serialisable view.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Generate a short correlation ID (8 characters) for compact logging.
pub fn generate_short_correlation_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Executor metrics collection.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    /// Total number of queries started.
    pub queries_total: AtomicU64,

    /// Queries whose stream was fully delivered.
    pub queries_success: AtomicU64,

    /// Queries that failed before or during streaming.
    pub queries_failed: AtomicU64,

    /// Queries whose stream was dropped by the consumer before completion.
    pub queries_abandoned: AtomicU64,

    /// Time from execution start to stream completion, in milliseconds.
    pub query_time_ms_total: AtomicU64,

    /// Connections successfully opened.
    pub connections_opened: AtomicU64,

    /// Connections closed.
    pub connections_closed: AtomicU64,

    /// Failed connection attempts.
    pub connection_errors: AtomicU64,

    /// Errors raised while closing connections.
    pub cleanup_errors: AtomicU64,

    /// Rows delivered to consumers.
    pub rows_streamed: AtomicU64,

    /// Batches delivered to consumers.
    pub batches_streamed: AtomicU64,
}

impl ExecutorMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a query.
    pub fn record_query_start(&self) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how a query ended.
    pub fn record_query_end(&self, outcome: QueryOutcome, duration: Duration) {
        let counter = match outcome {
            QueryOutcome::Completed => &self.queries_success,
            QueryOutcome::Failed => &self.queries_failed,
            QueryOutcome::Abandoned => &self.queries_abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.query_time_ms_total
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a connection being opened.
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection being closed.
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connection attempt.
    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error raised while closing a connection.
    pub fn record_cleanup_error(&self) {
        self.cleanup_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered batch.
    pub fn record_batch(&self, rows: usize) {
        self.batches_streamed.fetch_add(1, Ordering::Relaxed);
        self.rows_streamed.fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            queries_success: self.queries_success.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            queries_abandoned: self.queries_abandoned.load(Ordering::Relaxed),
            query_time_ms_total: self.query_time_ms_total.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
            rows_streamed: self.rows_streamed.load(Ordering::Relaxed),
            batches_streamed: self.batches_streamed.load(Ordering::Relaxed),
        }
    }
}

/// How a query's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Completed,
    Failed,
    Abandoned,
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub queries_success: u64,
    pub queries_failed: u64,
    pub queries_abandoned: u64,
    pub query_time_ms_total: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connection_errors: u64,
    pub cleanup_errors: u64,
    pub rows_streamed: u64,
    pub batches_streamed: u64,
}

impl MetricsSnapshot {
    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }

    /// Calculate query success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let finished = self.queries_success + self.queries_failed;
        if finished == 0 {
            return 100.0;
        }
        (self.queries_success as f64 / finished as f64) * 100.0
    }
}

/// Shared metrics type for thread-safe access.
pub type SharedMetrics = Arc<ExecutorMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_correlation_id() {
        let id = generate_short_correlation_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = ExecutorMetrics::new();
        metrics.record_query_start();
        metrics.record_query_start();
        metrics.record_query_end(QueryOutcome::Completed, Duration::from_millis(10));
        metrics.record_query_end(QueryOutcome::Failed, Duration::from_millis(5));
        metrics.record_connection_opened();
        metrics.record_batch(1000);
        metrics.record_batch(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_total, 2);
        assert_eq!(snapshot.query_time_ms_total, 15);
        assert_eq!(snapshot.rows_streamed, 1003);
        assert_eq!(snapshot.batches_streamed, 2);
        assert_eq!(snapshot.open_connections(), 1);
        assert_eq!(snapshot.success_rate(), 50.0);
    }
}
