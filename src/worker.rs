mod cycle;
mod stats;

#[cfg(test)]
mod tests;

pub use cycle::CycleOutcome;
pub use stats::{StatsSnapshot, WorkerStats};

use crate::error::WorkerError;
use crate::inference::{InferenceBridge, ModelService};
use crate::sanitize::ResultSanitizer;
use crate::store::{EventSource, ResultSink};
use crate::watermark::{WatermarkStore, DEFAULT_LOOKBACK_HOURS};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INTERVAL_MINUTES: u64 = 10;
pub const DEFAULT_STATS_EVERY: u64 = 10;
pub const DEFAULT_WRITE_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Initializing,
    Polling,
    Processing,
    Persisting,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerState::Idle => "idle",
            WorkerState::Initializing => "initializing",
            WorkerState::Polling => "polling",
            WorkerState::Processing => "processing",
            WorkerState::Persisting => "persisting",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub interval: Duration,
    pub lookback: chrono::Duration,
    /// Log cumulative counters every this many cycles; 0 disables.
    pub stats_every: u64,
    pub write_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INTERVAL_MINUTES * 60),
            lookback: chrono::Duration::hours(DEFAULT_LOOKBACK_HOURS),
            stats_every: DEFAULT_STATS_EVERY,
            write_retries: DEFAULT_WRITE_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Polls new events past the watermark, scores them and appends the results.
///
/// One cycle runs at a time and the watermark only moves after the cycle's
/// rows are durably appended, so a failed cycle is retried in full by the
/// next one.
pub struct IncrementalWorker<S, M> {
    store: Arc<S>,
    bridge: InferenceBridge<M>,
    sanitizer: ResultSanitizer,
    options: WorkerOptions,
    state: WorkerState,
    watermark: Option<WatermarkStore>,
    registry: BTreeSet<String>,
    stats: Arc<WorkerStats>,
}

impl<S, M> IncrementalWorker<S, M>
where
    S: EventSource + ResultSink,
    M: ModelService,
{
    pub fn new(
        store: Arc<S>,
        bridge: InferenceBridge<M>,
        sanitizer: ResultSanitizer,
        options: WorkerOptions,
    ) -> Self {
        Self {
            store,
            bridge,
            sanitizer,
            options,
            state: WorkerState::Idle,
            watermark: None,
            registry: BTreeSet::new(),
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn watermark(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.watermark.map(|w| w.current())
    }

    /// Loads the model registry and establishes the starting watermark.
    ///
    /// An empty or unreachable registry stops the worker before any cycle runs.
    pub async fn initialize(&mut self) -> Result<(), WorkerError> {
        self.state = WorkerState::Initializing;

        let registry = match self.bridge.available_variables().await {
            Ok(registry) => registry,
            Err(err) => {
                self.state = WorkerState::Stopped;
                self.stats.record_error(err.to_string());
                return Err(WorkerError::Registry(err));
            }
        };
        if registry.is_empty() {
            self.state = WorkerState::Stopped;
            return Err(WorkerError::NoModels);
        }

        let existing = match self.store.max_processed_timestamp().await {
            Ok(existing) => existing,
            Err(err) => {
                self.state = WorkerState::Stopped;
                self.stats.record_error(err.to_string());
                return Err(err.into());
            }
        };
        let watermark = WatermarkStore::from_existing(existing, self.options.lookback);
        tracing::info!(
            models = registry.len(),
            watermark = %watermark.current(),
            resumed = existing.is_some(),
            "worker initialized"
        );

        self.registry = registry;
        self.watermark = Some(watermark);
        self.state = WorkerState::Idle;
        Ok(())
    }

    /// Runs a single cycle, initializing first when needed.
    pub async fn run_once(&mut self) -> Result<CycleOutcome, WorkerError> {
        let outcome = self.run_cycle().await?;
        self.stats.log_summary("single cycle finished");
        Ok(outcome)
    }

    /// Cycles until `cancel` fires. Cancellation is honoured between cycles
    /// and during the idle sleep, never in the middle of a write.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), WorkerError> {
        if self.watermark.is_none() {
            self.initialize().await?;
        }
        tracing::info!(
            interval_secs = self.options.interval.as_secs(),
            "incremental worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.run_cycle().await?;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        }

        self.state = WorkerState::Stopped;
        self.stats.log_summary("worker stopped");
        Ok(())
    }
}
