mod pg;


pub use pg::{build_pool, PgStore};

use crate::error::{StoreError, StoreResult};
use crate::records::{AnomalyRow, MeasurementEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

const MAX_IDENTIFIER_LEN: usize = 63;

/// Upstream long-form measurements.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events strictly newer than `since`, ordered by timestamp, variable
    /// name and insertion order.
    async fn query_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<MeasurementEvent>>;

    /// Events with `start <= timestamp <= end`, same ordering as
    /// [`EventSource::query_events`].
    async fn query_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<MeasurementEvent>>;

    /// Largest event timestamp in `(after, up_to]`.
    async fn max_event_timestamp(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Append-only destination for sanitized anomaly rows.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Appends every row or none of them. Returns the number of rows written.
    async fn append_batch(&self, rows: &[AnomalyRow]) -> StoreResult<u64>;

    async fn max_processed_timestamp(&self) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Idempotent creation of the tables and indexes the worker relies on.
#[async_trait]
pub trait SchemaBootstrap: Send + Sync {
    async fn ensure_event_table(&self) -> StoreResult<()>;

    async fn ensure_anomaly_table(&self) -> StoreResult<()>;
}

/// A validated `schema.table` pair, safe to splice into SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    schema: String,
    table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> StoreResult<Self> {
        Ok(Self {
            schema: validate_identifier(schema)?,
            table: validate_identifier(table)?,
        })
    }

    /// Accepts `table` or `schema.table`; a bare name lands in `default_schema`.
    pub fn parse(raw: &str, default_schema: &str) -> StoreResult<Self> {
        match raw.trim().split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new(default_schema, raw),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn index_name(&self, suffix: &str) -> String {
        format!("idx_{}_{}", self.table, suffix)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

fn validate_identifier(raw: &str) -> StoreResult<String> {
    let trimmed = raw.trim();
    let mut chars = trimmed.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || trimmed.len() > MAX_IDENTIFIER_LEN {
        return Err(StoreError::InvalidIdentifier(raw.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}
