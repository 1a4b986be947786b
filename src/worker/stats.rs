use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Cumulative counters shared between the worker and whoever reports on it.
#[derive(Debug)]
pub struct WorkerStats {
    pub cycles: AtomicU64,
    pub datetimes_processed: AtomicU64,
    pub anomalies_found: AtomicU64,
    pub records_written: AtomicU64,
    pub failed_cycles: AtomicU64,
    pub summaries_logged: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub datetimes_processed: u64,
    pub anomalies_found: u64,
    pub records_written: u64,
    pub failed_cycles: u64,
    pub last_error: Option<String>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            cycles: AtomicU64::new(0),
            datetimes_processed: AtomicU64::new(0),
            anomalies_found: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            summaries_logged: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Bumps the cycle counter and returns the new cycle number.
    pub fn begin_cycle(&self) -> u64 {
        self.cycles.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_persisted(&self, datetimes: u64, records: u64, anomalies: u64) {
        self.datetimes_processed.fetch_add(datetimes, Ordering::Relaxed);
        self.records_written.fetch_add(records, Ordering::Relaxed);
        self.anomalies_found.fetch_add(anomalies, Ordering::Relaxed);
    }

    pub fn record_failure(&self, err: impl Into<String>) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            datetimes_processed: self.datetimes_processed.load(Ordering::Relaxed),
            anomalies_found: self.anomalies_found.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }

    pub fn log_summary(&self, message: &'static str) {
        self.summaries_logged.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.snapshot();
        tracing::info!(
            cycles = snapshot.cycles,
            datetimes_processed = snapshot.datetimes_processed,
            anomalies_found = snapshot.anomalies_found,
            records_written = snapshot.records_written,
            failed_cycles = snapshot.failed_cycles,
            last_error = snapshot.last_error.as_deref().unwrap_or("-"),
            "{message}"
        );
    }
}
