use crate::error::WorkerError;
use crate::inference::{self, DetectOutcome, InferenceBridge, ModelService, VariableSummary};
use crate::sanitize::ResultSanitizer;
use crate::shape::{self, DEFAULT_DATETIME_COLUMN};
use crate::store::{EventSource, ResultSink};
use chrono::{DateTime, Utc};

pub const SUMMARY_TOP_VARIABLES: usize = 5;

/// Result of scoring a fixed time range once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    pub events: usize,
    pub datetimes: usize,
    pub variables: usize,
    pub failed_variables: Vec<String>,
    pub records: usize,
    pub anomalies: usize,
    pub written: u64,
    pub summary: Vec<VariableSummary>,
}

impl BackfillReport {
    pub fn anomaly_rate(&self) -> f64 {
        if self.records == 0 {
            0.0
        } else {
            self.anomalies as f64 / self.records as f64
        }
    }

    pub fn top(&self, n: usize) -> &[VariableSummary] {
        &self.summary[..n.min(self.summary.len())]
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "scored {} datetimes across {} variables: {} records, {} anomalies ({:.2}%)\n",
            self.datetimes,
            self.variables,
            self.records,
            self.anomalies,
            self.anomaly_rate() * 100.0
        );
        if !self.failed_variables.is_empty() {
            out.push_str(&format!(
                "failed variables: {}\n",
                self.failed_variables.join(", ")
            ));
        }
        for entry in self.top(SUMMARY_TOP_VARIABLES) {
            out.push_str(&format!(
                "  {:<32} {:>6} / {:<6} {:>6.2}%\n",
                entry.variable,
                entry.anomalies,
                entry.points,
                entry.anomaly_rate() * 100.0
            ));
        }
        out
    }
}

/// Scores every event in `[start, end]` and appends the results.
///
/// Unlike the incremental worker this keeps no watermark; running it twice
/// over the same range appends the rows twice.
pub async fn detect_range<S, M>(
    store: &S,
    bridge: &InferenceBridge<M>,
    sanitizer: &ResultSanitizer,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<BackfillReport, WorkerError>
where
    S: EventSource + ResultSink,
    M: ModelService,
{
    let registry = bridge
        .available_variables()
        .await
        .map_err(WorkerError::Registry)?;
    if registry.is_empty() {
        return Err(WorkerError::NoModels);
    }

    let events = store.query_range(start, end).await?;
    let rows = shape::widen(&events);
    let mut report = BackfillReport {
        events: events.len(),
        datetimes: rows.len(),
        ..BackfillReport::default()
    };
    if rows.is_empty() {
        tracing::info!(start = ?start, end = ?end, "no events in range");
        return Ok(report);
    }

    let variables = inference::resolve_variables(&shape::columns(&rows), &registry);
    report.variables = variables.len();
    let detection = match bridge
        .detect(&rows, &variables, DEFAULT_DATETIME_COLUMN)
        .await
    {
        DetectOutcome::NoOverlap => {
            tracing::info!(models = registry.len(), "no variable in range has a model");
            return Ok(report);
        }
        DetectOutcome::Scored(detection) => detection,
    };
    report.failed_variables = detection.failed_variables.clone();

    let sanitized = sanitizer.sanitize(detection.records);
    report.records = sanitized.len();
    report.anomalies = sanitized.iter().filter(|row| row.is_anomaly()).count();
    report.written = store.append_batch(&sanitized).await?;
    report.summary = inference::summarize(&sanitized);

    tracing::info!(
        events = report.events,
        datetimes = report.datetimes,
        records = report.records,
        anomalies = report.anomalies,
        "range detection finished"
    );
    Ok(report)
}
