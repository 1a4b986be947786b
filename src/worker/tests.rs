use super::{CycleOutcome, IncrementalWorker, WorkerOptions, WorkerState};
use crate::error::{ModelError, StoreError, StoreResult, WorkerError};
use crate::inference::{BridgeOptions, InferenceBridge, ModelService};
use crate::records::{AnomalyRow, MeasurementEvent, ScoredPoint, SeriesPoint};
use crate::sanitize::ResultSanitizer;
use crate::store::{EventSource, ResultSink};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MemoryStore {
    events: Mutex<Vec<MeasurementEvent>>,
    appended: Mutex<Vec<AnomalyRow>>,
    failing_appends: AtomicU32,
    failing_queries: AtomicU32,
    append_calls: AtomicU32,
    polled: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl MemoryStore {
    fn with_events(events: Vec<MeasurementEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    fn push(&self, event: MeasurementEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn appended(&self) -> Vec<AnomalyRow> {
        self.appended.lock().unwrap().clone()
    }

    fn sorted_since(&self, keep: impl Fn(DateTime<Utc>) -> bool) -> Vec<MeasurementEvent> {
        let mut events: Vec<MeasurementEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| keep(event.timestamp))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.variable_name.cmp(&b.variable_name))
        });
        events
    }
}

#[async_trait]
impl EventSource for MemoryStore {
    async fn query_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<MeasurementEvent>> {
        self.polled.lock().unwrap().push(since);
        let remaining = self.failing_queries.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_queries.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("statement timeout".to_string()));
        }
        Ok(self.sorted_since(|ts| since.map_or(true, |since| ts > since)))
    }

    async fn query_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<MeasurementEvent>> {
        Ok(self.sorted_since(|ts| {
            start.map_or(true, |start| ts >= start) && end.map_or(true, |end| ts <= end)
        }))
    }

    async fn max_event_timestamp(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .sorted_since(|ts| ts > after && ts <= up_to)
            .last()
            .map(|event| event.timestamp))
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn append_batch(&self, rows: &[AnomalyRow]) -> StoreResult<u64> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_appends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_appends.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.appended.lock().unwrap().extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn max_processed_timestamp(&self) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.appended.lock().unwrap().iter().map(|row| row.timestamp).max())
    }
}

struct ThresholdModels {
    variables: BTreeSet<String>,
    failing: BTreeSet<String>,
    scored: Mutex<Vec<(String, Vec<SeriesPoint>)>>,
}

impl ThresholdModels {
    fn new(variables: &[&str]) -> Self {
        Self {
            variables: variables.iter().map(|v| v.to_string()).collect(),
            failing: BTreeSet::new(),
            scored: Mutex::new(Vec::new()),
        }
    }

    /// Registered variables whose scoring call always errors.
    fn failing(mut self, variables: &[&str]) -> Self {
        self.failing = variables.iter().map(|v| v.to_string()).collect();
        self
    }
}

#[async_trait]
impl ModelService for ThresholdModels {
    async fn available_variables(&self) -> Result<BTreeSet<String>, ModelError> {
        Ok(self.variables.clone())
    }

    async fn score(
        &self,
        variable: &str,
        points: &[SeriesPoint],
    ) -> Result<Vec<ScoredPoint>, ModelError> {
        if !self.variables.contains(variable) {
            return Err(ModelError::UnknownVariable(variable.to_string()));
        }
        if self.failing.contains(variable) {
            return Err(ModelError::Failed(format!("{variable}: model crashed")));
        }
        self.scored
            .lock()
            .unwrap()
            .push((variable.to_string(), points.to_vec()));
        Ok(points
            .iter()
            .map(|p| ScoredPoint {
                timestamp: p.timestamp,
                observed: Some(p.value),
                predicted: Some(20.0),
                lower: Some(15.0),
                upper: Some(25.0),
                residual: Some(p.value - 20.0),
                outside_interval: !(15.0..=25.0).contains(&p.value),
                high_residual: (p.value - 20.0).abs() > 50.0,
                is_anomaly: !(15.0..=25.0).contains(&p.value),
                anomaly_score: Some((p.value - 20.0).abs() * 100.0),
                prediction_error_pct: None,
                source: None,
            })
            .collect())
    }
}

fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + ChronoDuration::minutes(minute)
}

fn event(minute: i64, variable: &str, value: f64) -> MeasurementEvent {
    MeasurementEvent::new(t(minute), variable, Some(value), None)
}

fn worker(
    store: Arc<MemoryStore>,
    models: ThresholdModels,
) -> IncrementalWorker<MemoryStore, ThresholdModels> {
    worker_with(store, models, WorkerOptions::default())
}

fn worker_with(
    store: Arc<MemoryStore>,
    models: ThresholdModels,
    options: WorkerOptions,
) -> IncrementalWorker<MemoryStore, ThresholdModels> {
    IncrementalWorker::new(
        store,
        InferenceBridge::new(Arc::new(models), BridgeOptions::default()),
        ResultSanitizer::default(),
        WorkerOptions {
            interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(1),
            ..options
        },
    )
}

/// Seeds a persisted row so the watermark starts at `t(0)`.
fn store_resuming_at_t0(events: Vec<MeasurementEvent>) -> Arc<MemoryStore> {
    let store = MemoryStore::with_events(events);
    store.appended.lock().unwrap().push(AnomalyRow {
        timestamp: t(0),
        variable_name: "A".to_string(),
        observed_value: None,
        predicted_value: None,
        predicted_lower: None,
        predicted_upper: None,
        residual: None,
        outside_interval: 0,
        high_residual: 0,
        is_anomaly: 0,
        anomaly_score: 0.0,
        prediction_error_pct: 0.0,
        source: "seed".to_string(),
    });
    Arc::new(store)
}

#[tokio::test]
async fn startup_without_models_is_fatal() {
    let store = Arc::new(MemoryStore::default());
    let mut worker = worker(store.clone(), ThresholdModels::new(&[]));

    let err = worker.initialize().await.unwrap_err();
    assert!(matches!(err, WorkerError::NoModels));
    assert_eq!(worker.state(), WorkerState::Stopped);

    let err = worker.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::NoModels));
    assert!(store.polled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn watermark_resumes_from_persisted_results() {
    let store = store_resuming_at_t0(Vec::new());
    let mut worker = worker(store, ThresholdModels::new(&["A"]));
    worker.initialize().await.unwrap();
    assert_eq!(worker.watermark(), Some(t(0)));
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn watermark_defaults_to_lookback_window() {
    let store = Arc::new(MemoryStore::default());
    let mut worker = worker(store, ThresholdModels::new(&["A"]));
    let before = Utc::now();
    worker.initialize().await.unwrap();
    let watermark = worker.watermark().unwrap();
    assert!(watermark <= before - ChronoDuration::hours(24) + ChronoDuration::seconds(5));
    assert!(watermark >= before - ChronoDuration::hours(24) - ChronoDuration::seconds(5));
}

#[tokio::test]
async fn zero_new_events_leave_watermark_untouched() {
    let store = store_resuming_at_t0(vec![event(0, "A", 10.0)]);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoNewData);
    assert_eq!(worker.watermark(), Some(t(0)));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn all_null_window_holds_watermark() {
    let store = store_resuming_at_t0(vec![
        MeasurementEvent::new(t(1), "A", None, None),
        MeasurementEvent::new(t(2), "A", Some(f64::NAN), None),
    ]);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoNewData);
    assert_eq!(worker.watermark(), Some(t(0)));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_intersection_reports_no_overlap() {
    let store = store_resuming_at_t0(vec![event(1, "B", 5.0), event(2, "C", 6.0)]);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoOverlap { variables: 2 });
    assert_eq!(worker.watermark(), Some(t(0)));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn first_duplicate_is_scored_and_watermark_follows_persistence() {
    let store = store_resuming_at_t0(vec![
        event(1, "A", 10.0),
        event(1, "A", 99.0),
        event(1, "B", 5.0),
    ]);
    let models = ThresholdModels::new(&["A"]);
    let mut worker = worker(store.clone(), models);

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Persisted {
            datetimes: 1,
            records: 1,
            anomalies: 1,
            watermark: t(1),
        }
    );

    let appended: Vec<AnomalyRow> = store
        .appended()
        .into_iter()
        .filter(|row| row.source != "seed")
        .collect();
    assert_eq!(appended.len(), 1);
    assert_eq!(appended[0].timestamp, t(1));
    assert_eq!(appended[0].variable_name, "A");
    assert_eq!(appended[0].observed_value, Some(10.0));
    assert_eq!(appended[0].anomaly_score, 999.99);
    assert_eq!(appended[0].prediction_error_pct, 0.0);
    assert_eq!(appended[0].source, "unknown");
    assert_eq!(worker.watermark(), Some(t(1)));

    let scored = worker.bridge.model().scored.lock().unwrap().clone();
    assert_eq!(scored.len(), 1);
    assert_eq!(scored[0].0, "A");
    assert_eq!(scored[0].1[0].value, 10.0);

    let snapshot = worker.stats().snapshot();
    assert_eq!(snapshot.cycles, 1);
    assert_eq!(snapshot.datetimes_processed, 1);
    assert_eq!(snapshot.anomalies_found, 1);
}

#[tokio::test]
async fn failed_persistence_retries_same_window_next_cycle() {
    let store = store_resuming_at_t0(vec![
        event(1, "A", 20.0),
        event(2, "A", 21.0),
        event(3, "A", 80.0),
    ]);
    // First cycle: initial attempt plus both retries fail.
    store.failing_appends.store(3, Ordering::SeqCst);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::PersistFailed {
            datetimes: 3,
            records: 3
        }
    );
    assert_eq!(worker.watermark(), Some(t(0)));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 3);
    assert_eq!(worker.stats().snapshot().failed_cycles, 1);

    let outcome = worker.run_once().await.unwrap();
    let CycleOutcome::Persisted {
        datetimes,
        anomalies,
        watermark,
        ..
    } = outcome
    else {
        panic!("expected persisted outcome, got {outcome:?}");
    };
    assert_eq!(datetimes, 3);
    assert_eq!(anomalies, 1);
    assert_eq!(watermark, t(3));

    let polled = store.polled.lock().unwrap().clone();
    assert_eq!(polled, vec![Some(t(0)), Some(t(0))]);
    assert_eq!(worker.stats().snapshot().last_error, None);
}

#[tokio::test]
async fn transient_append_failure_is_absorbed_by_retry() {
    let store = store_resuming_at_t0(vec![event(1, "A", 20.0)]);
    store.failing_appends.store(1, Ordering::SeqCst);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));

    let outcome = worker.run_once().await.unwrap();
    assert!(outcome.advanced());
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 2);
    assert_eq!(worker.watermark(), Some(t(1)));
}

#[tokio::test]
async fn all_variables_failing_writes_nothing_and_holds_watermark() {
    let store = store_resuming_at_t0(vec![
        event(1, "A", 20.0),
        event(1, "B", 30.0),
        event(2, "A", 21.0),
    ]);
    let models = ThresholdModels::new(&["A", "B"]).failing(&["A", "B"]);
    let mut worker = worker(store.clone(), models);

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::AllVariablesFailed { variables: 2 });
    assert!(!outcome.advanced());
    assert_eq!(worker.watermark(), Some(t(0)));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);

    let snapshot = worker.stats().snapshot();
    assert_eq!(snapshot.failed_cycles, 1);
    assert_eq!(snapshot.records_written, 0);
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn partial_model_failure_persists_the_rest_and_advances() {
    let store = store_resuming_at_t0(vec![
        event(1, "A", 20.0),
        event(1, "B", 30.0),
        event(2, "A", 90.0),
    ]);
    let models = ThresholdModels::new(&["A", "B"]).failing(&["B"]);
    let mut worker = worker(store.clone(), models);

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Persisted {
            datetimes: 2,
            records: 2,
            anomalies: 1,
            watermark: t(2),
        }
    );
    let written: Vec<AnomalyRow> = store
        .appended()
        .into_iter()
        .filter(|row| row.source != "seed")
        .collect();
    assert_eq!(written.len(), 2);
    assert!(written.iter().all(|row| row.variable_name == "A"));
    assert_eq!(worker.watermark(), Some(t(2)));
    assert_eq!(worker.stats().snapshot().failed_cycles, 0);
}

#[tokio::test]
async fn failed_event_query_retries_from_same_watermark() {
    let store = store_resuming_at_t0(vec![event(1, "A", 20.0)]);
    store.failing_queries.store(1, Ordering::SeqCst);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));

    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, CycleOutcome::QueryFailed);
    assert_eq!(worker.watermark(), Some(t(0)));
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
    assert_eq!(worker.stats().snapshot().failed_cycles, 1);

    let outcome = worker.run_once().await.unwrap();
    assert!(outcome.advanced());
    assert_eq!(worker.watermark(), Some(t(1)));

    let polled = store.polled.lock().unwrap().clone();
    assert_eq!(polled, vec![Some(t(0)), Some(t(0))]);
}

#[tokio::test]
async fn stats_summary_is_logged_every_n_cycles() {
    let store = store_resuming_at_t0(Vec::new());
    let mut worker = worker_with(
        store.clone(),
        ThresholdModels::new(&["A"]),
        WorkerOptions {
            stats_every: 2,
            ..WorkerOptions::default()
        },
    );
    let stats = worker.stats();

    worker.run_cycle().await.unwrap();
    assert_eq!(stats.summaries_logged.load(Ordering::SeqCst), 0);
    worker.run_cycle().await.unwrap();
    assert_eq!(stats.summaries_logged.load(Ordering::SeqCst), 1);
    worker.run_cycle().await.unwrap();
    worker.run_cycle().await.unwrap();
    assert_eq!(stats.summaries_logged.load(Ordering::SeqCst), 2);
    assert_eq!(stats.snapshot().cycles, 4);

    let mut silent = worker_with(
        store,
        ThresholdModels::new(&["A"]),
        WorkerOptions {
            stats_every: 0,
            ..WorkerOptions::default()
        },
    );
    silent.run_cycle().await.unwrap();
    silent.run_cycle().await.unwrap();
    assert_eq!(silent.stats().summaries_logged.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn later_events_are_picked_up_incrementally() {
    let store = store_resuming_at_t0(vec![event(1, "A", 20.0)]);
    let models = ThresholdModels::new(&["A"]);
    let mut worker = worker(store.clone(), models);

    assert!(worker.run_once().await.unwrap().advanced());
    store.push(event(5, "A", 22.0));
    store.push(event(4, "A", 19.0));

    let outcome = worker.run_once().await.unwrap();
    let CycleOutcome::Persisted { datetimes, watermark, .. } = outcome else {
        panic!("expected persisted outcome, got {outcome:?}");
    };
    assert_eq!(datetimes, 2);
    assert_eq!(watermark, t(5));

    let scored = worker_scored_minutes(&store);
    assert_eq!(scored, vec![1, 4, 5]);
}

fn worker_scored_minutes(store: &MemoryStore) -> Vec<i64> {
    store
        .appended()
        .into_iter()
        .filter(|row| row.source != "seed")
        .map(|row| (row.timestamp - t(0)).num_minutes())
        .collect()
}

#[tokio::test]
async fn cancellation_stops_the_loop_between_cycles() {
    let store = store_resuming_at_t0(vec![event(1, "A", 20.0)]);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), worker.run(cancel))
        .await
        .expect("worker did not stop after cancellation")
        .unwrap();

    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(worker.watermark(), Some(t(1)));
    assert!(worker.stats().snapshot().cycles >= 1);
}

#[tokio::test]
async fn pre_cancelled_token_runs_no_cycle() {
    let store = store_resuming_at_t0(vec![event(1, "A", 20.0)]);
    let mut worker = worker(store.clone(), ThresholdModels::new(&["A"]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    worker.run(cancel).await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(worker.stats().snapshot().cycles, 0);
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn range_detection_scores_inclusive_window_with_batch_label() {
    let store = MemoryStore::with_events(vec![
        event(1, "A", 20.0),
        event(2, "A", 90.0),
        event(2, "B", 1.0),
        event(3, "A", 21.0),
    ]);
    let bridge = InferenceBridge::new(
        Arc::new(ThresholdModels::new(&["A"])),
        BridgeOptions {
            source_fallback: "sql_batch".to_string(),
            ..BridgeOptions::default()
        },
    );

    let report = crate::backfill::detect_range(
        &store,
        &bridge,
        &ResultSanitizer::default(),
        Some(t(2)),
        Some(t(3)),
    )
    .await
    .unwrap();

    assert_eq!(report.datetimes, 2);
    assert_eq!(report.variables, 1);
    assert_eq!(report.records, 2);
    assert_eq!(report.anomalies, 1);
    assert_eq!(report.written, 2);
    assert_eq!(report.summary[0].variable, "A");
    assert!(store.appended().iter().all(|row| row.source == "sql_batch"));
    assert!(store.polled.lock().unwrap().is_empty());
}
