use crate::error::StoreResult;
use crate::inference::{
    BridgeOptions, DEFAULT_MODEL_CONCURRENCY, DEFAULT_MODEL_TIMEOUT, DEFAULT_SOURCE_FALLBACK,
};
use crate::sanitize::{ClampBounds, SCORE_CLAMP_MAX};
use crate::store::TableRef;
use crate::watermark::DEFAULT_LOOKBACK_HOURS;
use crate::worker::{
    WorkerOptions, DEFAULT_INTERVAL_MINUTES, DEFAULT_RETRY_BACKOFF, DEFAULT_STATS_EVERY,
    DEFAULT_WRITE_RETRIES,
};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "config/anomaly-worker.json";
pub const DEFAULT_INPUT_TABLE: &str = "process_measurements";
pub const DEFAULT_OUTPUT_TABLE: &str = "anomaly_detections";
pub const DEFAULT_BATCH_SOURCE_LABEL: &str = "sql_batch";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("ANOMALY_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    input_table: Option<String>,
    #[serde(default)]
    output_table: Option<String>,
    #[serde(default)]
    interval_minutes: Option<u64>,
    #[serde(default)]
    lookback_hours: Option<i64>,
    #[serde(default)]
    stats_every: Option<u64>,
    #[serde(default)]
    model_service_url: Option<String>,
    #[serde(default)]
    model_service_token: Option<String>,
    #[serde(default)]
    model_timeout_secs: Option<u64>,
    #[serde(default)]
    model_concurrency: Option<usize>,
    #[serde(default)]
    write_retries: Option<u32>,
    #[serde(default)]
    source_fallback: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-worker failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match parse_setup_overrides(contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "anomaly-worker failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn parse_setup_overrides(contents: String) -> simd_json::Result<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Applies setup-file values for every key whose env var is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("ANOMALY_SCHEMA") {
        if let Some(schema) = non_empty(overrides.schema.as_deref()) {
            config.schema = schema;
        }
    }
    if env_allows("ANOMALY_INPUT_TABLE") {
        if let Some(table) = non_empty(overrides.input_table.as_deref()) {
            config.input_table = table;
        }
    }
    if env_allows("ANOMALY_OUTPUT_TABLE") {
        if let Some(table) = non_empty(overrides.output_table.as_deref()) {
            config.output_table = table;
        }
    }
    if env_allows("ANOMALY_INTERVAL_MINUTES") {
        if let Some(value) = overrides.interval_minutes.filter(|v| *v != 0) {
            config.interval_minutes = value;
        }
    }
    if env_allows("ANOMALY_LOOKBACK_HOURS") {
        if let Some(value) = overrides.lookback_hours.filter(|v| *v > 0) {
            config.lookback_hours = value;
        }
    }
    if env_allows("ANOMALY_STATS_EVERY") {
        if let Some(value) = overrides.stats_every {
            config.stats_every = value;
        }
    }
    if env_allows("ANOMALY_MODEL_SERVICE_URL") {
        if let Some(url) = non_empty(overrides.model_service_url.as_deref()) {
            config.model_service_url = Some(url);
        }
    }
    if env_allows("ANOMALY_MODEL_SERVICE_TOKEN") {
        if let Some(token) = overrides.model_service_token.as_deref() {
            config.model_service_token = non_empty(Some(token));
        }
    }
    if env_allows("ANOMALY_MODEL_TIMEOUT_SECS") {
        if let Some(value) = overrides.model_timeout_secs.filter(|v| *v != 0) {
            config.model_timeout_secs = value;
        }
    }
    if env_allows("ANOMALY_MODEL_CONCURRENCY") {
        if let Some(value) = overrides.model_concurrency.filter(|v| *v != 0) {
            config.model_concurrency = value;
        }
    }
    if env_allows("ANOMALY_WRITE_RETRIES") {
        if let Some(value) = overrides.write_retries {
            config.write_retries = value;
        }
    }
    if env_allows("ANOMALY_SOURCE_FALLBACK") {
        if let Some(label) = non_empty(overrides.source_fallback.as_deref()) {
            config.source_fallback = label;
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub schema: String,
    pub input_table: String,
    pub output_table: String,
    pub interval_minutes: u64,
    pub lookback_hours: i64,
    pub stats_every: u64,
    pub model_service_url: Option<String>,
    pub model_service_token: Option<String>,
    pub model_timeout_secs: u64,
    pub model_concurrency: usize,
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
    pub source_fallback: String,
    pub batch_source_label: String,
    pub clamp_max: f64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env::var("ANOMALY_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.database_url.as_deref()))
            })
            .context("ANOMALY_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let clamp_max = validate_clamp_max(env_or("ANOMALY_CLAMP_MAX", SCORE_CLAMP_MAX))?;

        let mut config = Self {
            database_url,
            db_pool_size: env_or("ANOMALY_DB_POOL_SIZE", 5),
            schema: env::var("ANOMALY_SCHEMA").unwrap_or_else(|_| "public".to_string()),
            input_table: env::var("ANOMALY_INPUT_TABLE")
                .unwrap_or_else(|_| DEFAULT_INPUT_TABLE.to_string()),
            output_table: env::var("ANOMALY_OUTPUT_TABLE")
                .unwrap_or_else(|_| DEFAULT_OUTPUT_TABLE.to_string()),
            interval_minutes: env_or("ANOMALY_INTERVAL_MINUTES", DEFAULT_INTERVAL_MINUTES),
            lookback_hours: env_or("ANOMALY_LOOKBACK_HOURS", DEFAULT_LOOKBACK_HOURS),
            stats_every: env_or("ANOMALY_STATS_EVERY", DEFAULT_STATS_EVERY),
            model_service_url: non_empty(env::var("ANOMALY_MODEL_SERVICE_URL").ok().as_deref()),
            model_service_token: non_empty(
                env::var("ANOMALY_MODEL_SERVICE_TOKEN").ok().as_deref(),
            ),
            model_timeout_secs: env_or(
                "ANOMALY_MODEL_TIMEOUT_SECS",
                DEFAULT_MODEL_TIMEOUT.as_secs(),
            ),
            model_concurrency: env_or("ANOMALY_MODEL_CONCURRENCY", DEFAULT_MODEL_CONCURRENCY),
            write_retries: env_or("ANOMALY_WRITE_RETRIES", DEFAULT_WRITE_RETRIES),
            retry_backoff_ms: env_or(
                "ANOMALY_RETRY_BACKOFF_MS",
                DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            ),
            source_fallback: env::var("ANOMALY_SOURCE_FALLBACK")
                .unwrap_or_else(|_| DEFAULT_SOURCE_FALLBACK.to_string()),
            batch_source_label: env::var("ANOMALY_BATCH_SOURCE_LABEL")
                .unwrap_or_else(|_| DEFAULT_BATCH_SOURCE_LABEL.to_string()),
            clamp_max,
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| !env_is_set(key));
        }

        config.events_table()?;
        config.anomalies_table()?;
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookback_hours.max(1))
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn events_table(&self) -> StoreResult<TableRef> {
        TableRef::parse(&self.input_table, &self.schema)
    }

    pub fn anomalies_table(&self) -> StoreResult<TableRef> {
        TableRef::parse(&self.output_table, &self.schema)
    }

    pub fn model_service_url(&self) -> Result<&str> {
        self.model_service_url
            .as_deref()
            .context("ANOMALY_MODEL_SERVICE_URL is required to score events")
    }

    pub fn clamp_bounds(&self) -> ClampBounds {
        ClampBounds {
            min: 0.0,
            max: self.clamp_max,
        }
    }

    /// Bridge settings with `source_fallback` as the provenance of last resort.
    pub fn bridge_options(&self, source_fallback: &str) -> BridgeOptions {
        BridgeOptions {
            concurrency: self.model_concurrency.max(1),
            timeout: self.model_timeout(),
            source_fallback: source_fallback.to_string(),
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            interval: self.interval(),
            lookback: self.lookback(),
            stats_every: self.stats_every,
            write_retries: self.write_retries,
            retry_backoff: self.retry_backoff(),
        }
    }
}

/// The score columns are `NUMERIC(5,2)`; a larger bound would overflow every insert.
fn validate_clamp_max(clamp_max: f64) -> Result<f64> {
    if !clamp_max.is_finite() || clamp_max <= 0.0 || clamp_max > SCORE_CLAMP_MAX {
        anyhow::bail!("ANOMALY_CLAMP_MAX must be in (0, {SCORE_CLAMP_MAX}], got {clamp_max}");
    }
    Ok(clamp_max)
}

fn normalize_database_url(url: String) -> String {
    for prefix in [
        "postgresql+psycopg2://",
        "postgresql+psycopg://",
        "postgresql+asyncpg://",
    ] {
        if let Some(stripped) = url.strip_prefix(prefix) {
            return format!("postgresql://{stripped}");
        }
    }
    url
}
