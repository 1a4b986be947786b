use crate::error::ModelError;
use crate::records::{AnomalyRecord, AnomalyRow, ScoredPoint, SeriesPoint, WideRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_SOURCE_FALLBACK: &str = "unknown";
pub const DEFAULT_MODEL_CONCURRENCY: usize = 4;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

/// Registry plus scoring endpoint of the trained per-variable models.
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn available_variables(&self) -> Result<BTreeSet<String>, ModelError>;

    async fn score(
        &self,
        variable: &str,
        points: &[SeriesPoint],
    ) -> Result<Vec<ScoredPoint>, ModelError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectOutcome {
    /// None of the batch's variables has a model.
    NoOverlap,
    Scored(Detection),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub records: Vec<AnomalyRecord>,
    pub scored_variables: Vec<String>,
    pub failed_variables: Vec<String>,
}

impl Detection {
    pub fn all_failed(&self) -> bool {
        self.scored_variables.is_empty() && !self.failed_variables.is_empty()
    }

    pub fn anomaly_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_anomaly).count()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub concurrency: usize,
    pub timeout: Duration,
    pub source_fallback: String,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_MODEL_CONCURRENCY,
            timeout: DEFAULT_MODEL_TIMEOUT,
            source_fallback: DEFAULT_SOURCE_FALLBACK.to_string(),
        }
    }
}

pub struct InferenceBridge<M> {
    model: Arc<M>,
    options: BridgeOptions,
}

impl<M: ModelService> InferenceBridge<M> {
    pub fn new(model: Arc<M>, options: BridgeOptions) -> Self {
        Self { model, options }
    }

    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    pub fn source_fallback(&self) -> &str {
        &self.options.source_fallback
    }

    pub async fn available_variables(&self) -> Result<BTreeSet<String>, ModelError> {
        self.model.available_variables().await
    }

    /// Scores every variable in `variables` against its projection of `rows`.
    ///
    /// A failing variable is logged and listed in `failed_variables`; the
    /// others still produce records. Records come back grouped in the order
    /// of `variables` regardless of which call finished first.
    pub async fn detect(
        &self,
        rows: &[WideRow],
        variables: &[String],
        datetime_column: &str,
    ) -> DetectOutcome {
        let variables: Vec<&String> = variables
            .iter()
            .filter(|variable| variable.as_str() != datetime_column)
            .collect();
        if variables.is_empty() {
            return DetectOutcome::NoOverlap;
        }

        let by_timestamp: HashMap<DateTime<Utc>, &WideRow> =
            rows.iter().map(|row| (row.timestamp, row)).collect();

        let mut results: Vec<_> = stream::iter(variables.into_iter().enumerate())
            .map(move |(index, variable)| async move {
                let points = project(rows, variable);
                let started = Instant::now();
                let result = self.score_one(variable, &points).await;
                (index, variable, points.len(), started.elapsed(), result)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, ..)| *index);

        let mut detection = Detection::default();
        for (_, variable, input_points, elapsed, result) in results {
            match result {
                Ok(points) => {
                    tracing::debug!(
                        variable = %variable,
                        input_points,
                        scored = points.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "scored variable"
                    );
                    detection.records.extend(
                        points
                            .into_iter()
                            .map(|point| self.attach_source(variable, point, &by_timestamp)),
                    );
                    detection.scored_variables.push(variable.clone());
                }
                Err(err) => {
                    tracing::warn!(
                        variable = %variable,
                        input_points,
                        error = %err,
                        "model scoring failed; skipping variable"
                    );
                    detection.failed_variables.push(variable.clone());
                }
            }
        }

        DetectOutcome::Scored(detection)
    }

    async fn score_one(
        &self,
        variable: &str,
        points: &[SeriesPoint],
    ) -> Result<Vec<ScoredPoint>, ModelError> {
        if points.is_empty() {
            return Ok(Vec::new());
        }
        tokio::time::timeout(self.options.timeout, self.model.score(variable, points))
            .await
            .map_err(|_| ModelError::Timeout(self.options.timeout))?
    }

    fn attach_source(
        &self,
        variable: &str,
        mut point: ScoredPoint,
        by_timestamp: &HashMap<DateTime<Utc>, &WideRow>,
    ) -> AnomalyRecord {
        let source = point
            .source
            .take()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                by_timestamp
                    .get(&point.timestamp)
                    .and_then(|row| row.source(variable))
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.options.source_fallback.clone());
        AnomalyRecord::from_scored(variable, point, source)
    }
}

/// Timestamp plus one variable, for the timestamps where it has a value.
pub fn project(rows: &[WideRow], variable: &str) -> Vec<SeriesPoint> {
    rows.iter()
        .filter_map(|row| {
            row.value(variable).map(|value| SeriesPoint {
                timestamp: row.timestamp,
                value,
            })
        })
        .collect()
}

/// Variables present in the batch that also have a model, sorted by name.
pub fn resolve_variables(columns: &BTreeSet<String>, registry: &BTreeSet<String>) -> Vec<String> {
    columns.intersection(registry).cloned().collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSummary {
    pub variable: String,
    pub points: usize,
    pub anomalies: usize,
}

impl VariableSummary {
    pub fn anomaly_rate(&self) -> f64 {
        if self.points == 0 {
            0.0
        } else {
            self.anomalies as f64 / self.points as f64
        }
    }
}

/// Per-variable totals, most anomalous first.
pub fn summarize(rows: &[AnomalyRow]) -> Vec<VariableSummary> {
    let mut totals: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for row in rows {
        let entry = totals.entry(row.variable_name.as_str()).or_default();
        entry.0 += 1;
        if row.is_anomaly() {
            entry.1 += 1;
        }
    }
    let mut summary: Vec<VariableSummary> = totals
        .into_iter()
        .map(|(variable, (points, anomalies))| VariableSummary {
            variable: variable.to_string(),
            points,
            anomalies,
        })
        .collect();
    summary.sort_by(|a, b| {
        b.anomalies
            .cmp(&a.anomalies)
            .then_with(|| a.variable.cmp(&b.variable))
    });
    summary
}
