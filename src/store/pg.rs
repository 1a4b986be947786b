use super::{EventSource, ResultSink, SchemaBootstrap, TableRef};
use crate::error::StoreResult;
use crate::records::{AnomalyRow, MeasurementEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::{Duration, Instant};

// 13 binds per anomaly row keeps a chunk well below the 65535 bind limit.
const ANOMALY_INSERT_CHUNK: usize = 1_000;
const EVENT_INSERT_CHUNK: usize = 5_000;

pub async fn build_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Event table, anomaly table and their bootstrap on one PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    events: TableRef,
    anomalies: TableRef,
}

impl PgStore {
    pub fn new(pool: PgPool, events: TableRef, anomalies: TableRef) -> Self {
        Self {
            pool,
            events,
            anomalies,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn events_table(&self) -> &TableRef {
        &self.events
    }

    pub fn anomalies_table(&self) -> &TableRef {
        &self.anomalies
    }

    /// Bulk-appends long-form events in one transaction.
    pub async fn insert_events(&self, events: &[MeasurementEvent]) -> StoreResult<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in events.chunks(EVENT_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (datetime, variable_name, value, source_file) ",
                self.events
            ));
            builder.push_values(chunk.iter(), |mut b, event| {
                b.push_bind(event.timestamp)
                    .push_bind(&event.variable_name)
                    .push_bind(event.value)
                    .push_bind(event.source.as_deref());
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn ensure_schema(&self, table: &TableRef) -> StoreResult<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", table.schema()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_indexes(&self, table: &TableRef, columns: &[(&str, &str)]) -> StoreResult<()> {
        for (suffix, column) in columns {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                table.index_name(suffix),
                table,
                column
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

fn event_from_row(row: &PgRow) -> StoreResult<MeasurementEvent> {
    Ok(MeasurementEvent {
        timestamp: row.try_get::<DateTime<Utc>, _>("datetime")?,
        variable_name: row.try_get::<String, _>("variable_name")?,
        value: row.try_get::<Option<f64>, _>("value")?,
        source: row.try_get::<Option<String>, _>("source_file")?,
    })
}

#[async_trait]
impl EventSource for PgStore {
    async fn query_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<MeasurementEvent>> {
        let started = Instant::now();
        let rows = sqlx::query(&format!(
            r#"
            SELECT datetime, variable_name, value, source_file
            FROM {}
            WHERE ($1::timestamptz IS NULL OR datetime > $1)
            ORDER BY datetime, variable_name, id
            "#,
            self.events
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let events = rows.iter().map(event_from_row).collect::<StoreResult<Vec<_>>>()?;
        tracing::debug!(
            rows = events.len(),
            since = ?since,
            micros = started.elapsed().as_micros() as u64,
            "queried new events"
        );
        Ok(events)
    }

    async fn query_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<MeasurementEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT datetime, variable_name, value, source_file
            FROM {}
            WHERE ($1::timestamptz IS NULL OR datetime >= $1)
              AND ($2::timestamptz IS NULL OR datetime <= $2)
            ORDER BY datetime, variable_name, id
            "#,
            self.events
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn max_event_timestamp(
        &self,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let max: Option<DateTime<Utc>> = sqlx::query_scalar(&format!(
            "SELECT MAX(datetime) FROM {} WHERE datetime > $1 AND datetime <= $2",
            self.events
        ))
        .bind(after)
        .bind(up_to)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }
}

#[async_trait]
impl ResultSink for PgStore {
    async fn append_batch(&self, rows: &[AnomalyRow]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(ANOMALY_INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (ds, y, yhat, yhat_lower, yhat_upper, residual, \
                 outside_interval, high_residual, is_anomaly, anomaly_score, \
                 variable, prediction_error_pct, source_file) ",
                self.anomalies
            ));
            builder.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.timestamp)
                    .push_bind(row.observed_value)
                    .push_bind(row.predicted_value)
                    .push_bind(row.predicted_lower)
                    .push_bind(row.predicted_upper)
                    .push_bind(row.residual)
                    .push_bind(row.outside_interval)
                    .push_bind(row.high_residual)
                    .push_bind(row.is_anomaly)
                    .push_bind(row.anomaly_score)
                    .push_bind(&row.variable_name)
                    .push_bind(row.prediction_error_pct)
                    .push_bind(&row.source);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        tracing::debug!(
            rows = inserted,
            micros = started.elapsed().as_micros() as u64,
            table = %self.anomalies,
            "appended anomaly rows"
        );
        Ok(inserted)
    }

    async fn max_processed_timestamp(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let max: Option<DateTime<Utc>> =
            sqlx::query_scalar(&format!("SELECT MAX(ds) FROM {}", self.anomalies))
                .fetch_one(&self.pool)
                .await?;
        Ok(max)
    }
}

#[async_trait]
impl SchemaBootstrap for PgStore {
    async fn ensure_event_table(&self) -> StoreResult<()> {
        self.ensure_schema(&self.events).await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                datetime TIMESTAMPTZ NOT NULL,
                variable_name VARCHAR(100) NOT NULL,
                value DOUBLE PRECISION,
                source_file VARCHAR(255),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.events
        ))
        .execute(&self.pool)
        .await?;
        self.ensure_indexes(
            &self.events,
            &[
                ("datetime", "datetime"),
                ("variable", "variable_name"),
                ("created", "created_at"),
            ],
        )
        .await?;
        tracing::info!(table = %self.events, "event table ready");
        Ok(())
    }

    async fn ensure_anomaly_table(&self) -> StoreResult<()> {
        self.ensure_schema(&self.anomalies).await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                ds TIMESTAMPTZ NOT NULL,
                y DOUBLE PRECISION,
                yhat DOUBLE PRECISION,
                yhat_lower DOUBLE PRECISION,
                yhat_upper DOUBLE PRECISION,
                residual DOUBLE PRECISION,
                outside_interval SMALLINT,
                high_residual SMALLINT,
                is_anomaly SMALLINT,
                anomaly_score NUMERIC(5,2),
                variable VARCHAR(100) NOT NULL,
                prediction_error_pct NUMERIC(5,2),
                source_file VARCHAR(255),
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.anomalies
        ))
        .execute(&self.pool)
        .await?;
        self.ensure_indexes(
            &self.anomalies,
            &[
                ("ds", "ds"),
                ("variable", "variable"),
                ("is_anomaly", "is_anomaly"),
                ("anomaly_score", "anomaly_score"),
                ("processed_at", "processed_at"),
            ],
        )
        .await?;
        tracing::info!(table = %self.anomalies, "anomaly table ready");
        Ok(())
    }
}
