use anomaly_worker::backfill;
use anomaly_worker::cli::{Args, Command};
use anomaly_worker::config::Config;
use anomaly_worker::import;
use anomaly_worker::inference::InferenceBridge;
use anomaly_worker::model_client::HttpModelService;
use anomaly_worker::sanitize::ResultSanitizer;
use anomaly_worker::store::{build_pool, PgStore, SchemaBootstrap};
use anomaly_worker::worker::IncrementalWorker;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,anomaly_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = config.otlp_endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "anomaly-worker"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn model_service(config: &Config) -> Result<Arc<HttpModelService>> {
    let service = HttpModelService::new(
        config.model_service_url()?,
        config.model_service_token.clone(),
        config.model_timeout(),
    )
    .context("failed to build model service client")?;
    Ok(Arc::new(service))
}

async fn run_worker(
    config: &Config,
    store: Arc<PgStore>,
    interval: Option<u64>,
    once: bool,
) -> Result<()> {
    store.ensure_event_table().await?;
    store.ensure_anomaly_table().await?;

    let mut options = config.worker_options();
    if let Some(minutes) = interval {
        options.interval = Duration::from_secs(minutes.max(1) * 60);
    }
    let bridge = InferenceBridge::new(
        model_service(config)?,
        config.bridge_options(&config.source_fallback),
    );
    let sanitizer = ResultSanitizer::new(config.clamp_bounds());
    let mut worker = IncrementalWorker::new(store, bridge, sanitizer, options);

    if once {
        let outcome = worker.run_once().await?;
        tracing::info!(outcome = ?outcome, "single cycle complete");
        println!("{}", serde_json::to_string_pretty(&worker.stats().snapshot())?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received; stopping after the current step");
        }
        signal_cancel.cancel();
    });

    worker.run(cancel).await?;
    Ok(())
}

async fn run_detect(
    config: &Config,
    store: Arc<PgStore>,
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<()> {
    store.ensure_event_table().await?;
    store.ensure_anomaly_table().await?;

    let bridge = InferenceBridge::new(
        model_service(config)?,
        config.bridge_options(&config.batch_source_label),
    );
    let sanitizer = ResultSanitizer::new(config.clamp_bounds());
    let report = backfill::detect_range(store.as_ref(), &bridge, &sanitizer, start, end).await?;
    print!("{}", report.render());
    Ok(())
}

async fn run_import(
    store: Arc<PgStore>,
    datetime_column: &str,
    files: &[std::path::PathBuf],
) -> Result<()> {
    store.ensure_event_table().await?;
    let report = import::import_files(&store, files, datetime_column).await?;
    println!(
        "imported {} events from {} rows in {} files ({} rows skipped)",
        report.events, report.rows, report.files, report.skipped_rows
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = Arc::new(PgStore::new(pool, config.events_table()?, config.anomalies_table()?));

    match args.command() {
        Command::Run { interval, once } => run_worker(&config, store, interval, once).await,
        Command::Detect { start, end } => run_detect(&config, store, start, end).await,
        Command::Import {
            datetime_column,
            files,
        } => run_import(store, &datetime_column, &files).await,
    }
}
