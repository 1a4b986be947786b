use crate::records::{AnomalyRecord, AnomalyRow};

/// Upper bound of the `NUMERIC(5,2)` score columns.
pub const SCORE_CLAMP_MAX: f64 = 999.99;

/// Width of the `VARCHAR(255)` source column, in characters.
pub const SOURCE_MAX_CHARS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for ClampBounds {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: SCORE_CLAMP_MAX,
        }
    }
}

impl ClampBounds {
    fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// Maps model output onto what the anomaly table can hold without overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultSanitizer {
    bounds: ClampBounds,
}

impl ResultSanitizer {
    pub fn new(bounds: ClampBounds) -> Self {
        Self { bounds }
    }

    pub fn bounds(&self) -> ClampBounds {
        self.bounds
    }

    pub fn sanitize(&self, records: Vec<AnomalyRecord>) -> Vec<AnomalyRow> {
        records
            .into_iter()
            .map(|record| self.sanitize_record(record))
            .collect()
    }

    pub fn sanitize_record(&self, record: AnomalyRecord) -> AnomalyRow {
        AnomalyRow {
            timestamp: record.timestamp,
            variable_name: record.variable_name,
            observed_value: record.observed_value,
            predicted_value: record.predicted_value,
            predicted_lower: record.predicted_lower,
            predicted_upper: record.predicted_upper,
            residual: record.residual,
            outside_interval: flag_bit(record.outside_interval),
            high_residual: flag_bit(record.high_residual),
            is_anomaly: flag_bit(record.is_anomaly),
            anomaly_score: self.score(record.anomaly_score),
            prediction_error_pct: self.error_pct(record.prediction_error_pct),
            source: truncate_source(record.source),
        }
    }

    /// Re-applies the storage bounds to a row. A row produced by
    /// [`ResultSanitizer::sanitize`] comes back unchanged.
    pub fn sanitize_row(&self, row: AnomalyRow) -> AnomalyRow {
        AnomalyRow {
            outside_interval: flag_bit(row.outside_interval != 0),
            high_residual: flag_bit(row.high_residual != 0),
            is_anomaly: flag_bit(row.is_anomaly != 0),
            anomaly_score: self.score(Some(row.anomaly_score)),
            prediction_error_pct: self.error_pct(Some(row.prediction_error_pct)),
            source: truncate_source(row.source),
            ..row
        }
    }

    // NaN counts as missing; infinities saturate at the bounds.
    fn score(&self, value: Option<f64>) -> f64 {
        let value = value.filter(|v| !v.is_nan()).unwrap_or(0.0);
        self.bounds.clamp(value)
    }

    // Infinite error percentages (zero prediction) are treated as missing.
    fn error_pct(&self, value: Option<f64>) -> f64 {
        let value = value.filter(|v| v.is_finite()).unwrap_or(0.0);
        self.bounds.clamp(value)
    }
}

fn truncate_source(mut source: String) -> String {
    if let Some((idx, _)) = source.char_indices().nth(SOURCE_MAX_CHARS) {
        source.truncate(idx);
    }
    source
}

pub fn flag_bit(flag: bool) -> i16 {
    if flag {
        1
    } else {
        0
    }
}
