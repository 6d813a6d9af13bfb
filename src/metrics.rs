//! Write Metrics
//!
//! Counters for one writer. Async writes report failures here instead of to
//! the caller, so this is where lost writes become visible.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Error;
use crate::wal::record::MapRecord;

/// Live counters shared between a writer and its background tasks
#[derive(Debug, Default)]
pub struct WriteMetrics {
    submitted: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

/// Point-in-time copy of [`WriteMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Writes accepted by `write` (sync writes count once they succeed)
    pub submitted: u64,
    /// Records the backend confirmed
    pub persisted: u64,
    /// Records the backend failed to store
    pub failed: u64,
    /// Async writes refused because the pool was saturated
    pub rejected: u64,
    /// Message of the most recent failure
    pub last_failure: Option<String>,
}

impl WriteMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count and log a background write failure
    pub(crate) fn record_failure(&self, record: &MapRecord, error: &Error) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            sequence = record.sequence(),
            operation = %record.operation(),
            key = %String::from_utf8_lossy(record.key()),
            "store map record failed: {}",
            error
        );
        *self.last_failure.lock() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_failure: self.last_failure.lock().clone(),
        }
    }
}

impl MetricsSnapshot {
    /// Accepted writes with no outcome yet (queued, running, or dropped on close)
    pub fn unresolved(&self) -> u64 {
        self.submitted.saturating_sub(self.persisted + self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = WriteMetrics::new();
        let record = MapRecord::put(1, "k", "String", "v", "String");

        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_persisted();
        metrics.record_failure(&record, &Error::BackendWrite("disk full".into()));
        metrics.record_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.persisted, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.unresolved(), 1);
        assert_eq!(
            snapshot.last_failure.as_deref(),
            Some("Backend write failed: disk full")
        );
    }
}
