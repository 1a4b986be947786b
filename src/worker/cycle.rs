use super::{IncrementalWorker, WorkerState};
use crate::error::{StoreError, WorkerError};
use crate::inference::{self, DetectOutcome, ModelService};
use crate::records::AnomalyRow;
use crate::shape::{self, DEFAULT_DATETIME_COLUMN};
use crate::store::{EventSource, ResultSink};
use chrono::{DateTime, Utc};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoNewData,
    /// The batch had events but none of its variables has a model.
    NoOverlap { variables: usize },
    /// Every model invocation failed; nothing was written.
    AllVariablesFailed { variables: usize },
    QueryFailed,
    PersistFailed { datetimes: usize, records: usize },
    Persisted {
        datetimes: usize,
        records: usize,
        anomalies: usize,
        watermark: DateTime<Utc>,
    },
}

impl CycleOutcome {
    pub fn advanced(&self) -> bool {
        matches!(self, CycleOutcome::Persisted { .. })
    }
}

impl<S, M> IncrementalWorker<S, M>
where
    S: EventSource + ResultSink,
    M: ModelService,
{
    /// Polls, scores and persists one batch. Only startup failures surface as
    /// errors; everything else is reported through the outcome and retried by
    /// the next cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, WorkerError> {
        if self.watermark.is_none() {
            self.initialize().await?;
        }

        let cycle = self.stats.begin_cycle();
        let span = tracing::info_span!("cycle", cycle, cycle_id = %Uuid::new_v4());
        let started = Instant::now();
        let outcome = self.process_batch().instrument(span.clone()).await;
        self.state = WorkerState::Idle;

        span.in_scope(|| {
            tracing::info!(
                outcome = ?outcome,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cycle finished"
            );
        });
        let every = self.options.stats_every;
        if every > 0 && cycle % every == 0 {
            self.stats.log_summary("worker stats");
        }
        Ok(outcome)
    }

    async fn process_batch(&mut self) -> CycleOutcome {
        let Some(since) = self.watermark.map(|w| w.current()) else {
            return CycleOutcome::QueryFailed;
        };

        self.state = WorkerState::Polling;
        let events = match self.store.query_events(Some(since)).await {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(error = %err, since = %since, "event query failed");
                self.stats.record_failure(err.to_string());
                return CycleOutcome::QueryFailed;
            }
        };
        let Some(batch_max) = events.iter().map(|e| e.timestamp).max() else {
            tracing::debug!(since = %since, "no new events");
            return CycleOutcome::NoNewData;
        };

        self.state = WorkerState::Processing;
        let rows = shape::widen(&events);
        if rows.is_empty() {
            tracing::info!(
                since = %since,
                events = events.len(),
                "new events carry no values; holding watermark"
            );
            return CycleOutcome::NoNewData;
        }
        tracing::info!(
            since = %since,
            events = events.len(),
            datetimes = rows.len(),
            "processing new events"
        );

        self.refresh_registry().await;
        let columns = shape::columns(&rows);
        let variables = inference::resolve_variables(&columns, &self.registry);
        let detection = match self
            .bridge
            .detect(&rows, &variables, DEFAULT_DATETIME_COLUMN)
            .await
        {
            DetectOutcome::NoOverlap => {
                tracing::info!(
                    columns = columns.len(),
                    models = self.registry.len(),
                    "no batch variable has a trained model"
                );
                return CycleOutcome::NoOverlap {
                    variables: columns.len(),
                };
            }
            DetectOutcome::Scored(detection) => detection,
        };
        if detection.all_failed() {
            let failed = detection.failed_variables.len();
            tracing::warn!(variables = failed, since = %since, "every variable failed to score");
            self.stats.record_failure(format!("all {failed} variables failed to score"));
            return CycleOutcome::AllVariablesFailed { variables: failed };
        }

        let sanitized = self.sanitizer.sanitize(detection.records);
        let anomalies = sanitized.iter().filter(|row| row.is_anomaly()).count();

        self.state = WorkerState::Persisting;
        if let Err(err) = self.append_with_retry(&sanitized).await {
            tracing::warn!(
                error = %err,
                since = %since,
                datetimes = rows.len(),
                records = sanitized.len(),
                "failed to persist anomaly rows; watermark unchanged"
            );
            self.stats.record_failure(err.to_string());
            return CycleOutcome::PersistFailed {
                datetimes: rows.len(),
                records: sanitized.len(),
            };
        }

        let candidate = match self.store.max_event_timestamp(since, batch_max).await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => batch_max,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "failed to re-read batch maximum; using polled maximum"
                );
                batch_max
            }
        };
        let watermark = match self.watermark.as_mut() {
            Some(watermark) => {
                watermark.advance(candidate);
                watermark.current()
            }
            None => candidate,
        };

        self.stats.record_persisted(
            rows.len() as u64,
            sanitized.len() as u64,
            anomalies as u64,
        );
        self.stats.clear_error();
        tracing::info!(
            datetimes = rows.len(),
            records = sanitized.len(),
            anomalies,
            watermark = %watermark,
            "cycle persisted"
        );
        CycleOutcome::Persisted {
            datetimes: rows.len(),
            records: sanitized.len(),
            anomalies,
            watermark,
        }
    }

    async fn refresh_registry(&mut self) {
        match self.bridge.available_variables().await {
            Ok(registry) if !registry.is_empty() => self.registry = registry,
            Ok(_) => {
                tracing::warn!("model registry came back empty; keeping previous registry");
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "model registry refresh failed; keeping previous registry"
                );
            }
        }
    }

    async fn append_with_retry(&self, rows: &[AnomalyRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut backoff = self.options.retry_backoff;
        let mut attempt = 0u32;
        loop {
            match self.store.append_batch(rows).await {
                Ok(written) => return Ok(written),
                Err(err) if attempt < self.options.write_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %err,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "append failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
