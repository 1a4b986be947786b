use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One long-form measurement as stored in the event table.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementEvent {
    pub timestamp: DateTime<Utc>,
    pub variable_name: String,
    pub value: Option<f64>,
    pub source: Option<String>,
}

impl MeasurementEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        variable_name: impl Into<String>,
        value: Option<f64>,
        source: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            variable_name: variable_name.into(),
            value,
            source,
        }
    }
}

/// All values observed at one timestamp, keyed by variable name.
///
/// `sources` holds the provenance of the event that won each cell; it only has
/// entries for cells that exist in `values` and whose event carried a source.
#[derive(Debug, Clone, PartialEq)]
pub struct WideRow {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, Option<f64>>,
    pub sources: BTreeMap<String, String>,
}

impl WideRow {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
            sources: BTreeMap::new(),
        }
    }

    pub fn value(&self, variable: &str) -> Option<f64> {
        self.values.get(variable).copied().flatten()
    }

    pub fn source(&self, variable: &str) -> Option<&str> {
        self.sources.get(variable).map(String::as_str)
    }
}

/// Single-variable projection of a wide row handed to the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// What a model returns for one point, before provenance is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub timestamp: DateTime<Utc>,
    pub observed: Option<f64>,
    pub predicted: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub residual: Option<f64>,
    pub outside_interval: bool,
    pub high_residual: bool,
    pub is_anomaly: bool,
    pub anomaly_score: Option<f64>,
    pub prediction_error_pct: Option<f64>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRecord {
    pub timestamp: DateTime<Utc>,
    pub variable_name: String,
    pub observed_value: Option<f64>,
    pub predicted_value: Option<f64>,
    pub predicted_lower: Option<f64>,
    pub predicted_upper: Option<f64>,
    pub residual: Option<f64>,
    pub outside_interval: bool,
    pub high_residual: bool,
    pub is_anomaly: bool,
    pub anomaly_score: Option<f64>,
    pub prediction_error_pct: Option<f64>,
    pub source: String,
}

impl AnomalyRecord {
    pub fn from_scored(variable_name: &str, point: ScoredPoint, source: String) -> Self {
        Self {
            timestamp: point.timestamp,
            variable_name: variable_name.to_string(),
            observed_value: point.observed,
            predicted_value: point.predicted,
            predicted_lower: point.lower,
            predicted_upper: point.upper,
            residual: point.residual,
            outside_interval: point.outside_interval,
            high_residual: point.high_residual,
            is_anomaly: point.is_anomaly,
            anomaly_score: point.anomaly_score,
            prediction_error_pct: point.prediction_error_pct,
            source,
        }
    }
}

/// Storage-safe form of an [`AnomalyRecord`]: flags as 0/1 and bounded
/// scores. `processed_at` is assigned by the database on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRow {
    pub timestamp: DateTime<Utc>,
    pub variable_name: String,
    pub observed_value: Option<f64>,
    pub predicted_value: Option<f64>,
    pub predicted_lower: Option<f64>,
    pub predicted_upper: Option<f64>,
    pub residual: Option<f64>,
    pub outside_interval: i16,
    pub high_residual: i16,
    pub is_anomaly: i16,
    pub anomaly_score: f64,
    pub prediction_error_pct: f64,
    pub source: String,
}

impl AnomalyRow {
    pub fn is_anomaly(&self) -> bool {
        self.is_anomaly != 0
    }
}
