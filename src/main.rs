use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use thermo_feed::broadcast::Broadcaster;
use thermo_feed::cache::SeriesCache;
use thermo_feed::config::{Config, ConfigFile};
use thermo_feed::ingest::Aggregator;
use thermo_feed::legend::Legend;
use thermo_feed::pipeline::{spawn_worker, IngestCommand, IngestHandle, IngestStats};
use thermo_feed::series::SeriesBuilder;
use thermo_feed::state::AppState;
use thermo_feed::store::Store;
use thermo_feed::{mqtt, routes};
use tokio::sync::{mpsc, oneshot};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,thermo_feed=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "thermo-feed"),
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
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    match &config.config_file {
        ConfigFile::Loaded(path) => tracing::info!(path = %path.display(), "loaded config file"),
        ConfigFile::Missing(path) => {
            tracing::warn!(path = %path.display(), "config file not found; using env only")
        }
    }

    let cache = Arc::new(SeriesCache::new());
    let store = Store::connect(&config.database_url, cache.clone())
        .await
        .with_context(|| format!("failed to open store at {}", config.database_url))?;
    let cached = cache.initialize_from_store(&store).await;

    let legend = Arc::new(Legend::new(config.sources.clone()));
    let series = SeriesBuilder::new(store.clone(), legend.clone());
    let broadcaster = Arc::new(Broadcaster::new(
        legend,
        series,
        config.subscriber_send_timeout(),
    ));

    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = mpsc::channel::<IngestCommand>(config.max_queue);
    let ingest = IngestHandle::new(tx, stats.clone());
    let aggregator = Aggregator::new(store.clone(), broadcaster.clone(), stats.clone());
    let worker_handle = spawn_worker(aggregator, rx, config.flush_check_interval());

    let publisher_handle = tokio::spawn(broadcaster.clone().run_publisher());

    let sweep_handle = {
        let broadcaster = broadcaster.clone();
        let sweep_interval = config.sweep_interval();
        let idle_timeout = ChronoDuration::from_std(config.idle_timeout())
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                broadcaster.sweep(Utc::now(), idle_timeout).await;
            }
        })
    };

    let cleanup_handle = {
        let cache = cache.clone();
        let cleanup_interval = config.cache_cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                cache.evict_expired();
            }
        })
    };

    let mut mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let ingest_clone = ingest.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, ingest_clone).await
        }))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(
        bind = %config.http_bind,
        sources = config.sources.len(),
        cached,
        "thermo-feed listening"
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        store: store.clone(),
        broadcaster: broadcaster.clone(),
        ingest_stats: stats.clone(),
    };
    let app = routes::router(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    let mut server_done = false;

    tokio::select! {
        res = &mut server_handle => {
            server_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server failed"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
            }
        }
        _ = async {
            match mqtt_handle.as_mut() {
                Some(handle) => match handle.await {
                    Ok(Ok(())) => tracing::warn!("MQTT listener exited"),
                    Ok(Err(err)) => tracing::error!(error=%err, "MQTT listener failed"),
                    Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                },
                None => future::pending::<()>().await,
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(handle) = mqtt_handle {
        handle.abort();
    }
    sweep_handle.abort();
    cleanup_handle.abort();

    match tokio::time::timeout(SHUTDOWN_GRACE, ingest.flush()).await {
        Ok(Ok(())) => tracing::info!("flushed open minute"),
        Ok(Err(err)) => tracing::warn!(error=%err, "final flush failed"),
        Err(_) => tracing::warn!("final flush timed out"),
    }
    drop(ingest);
    if tokio::time::timeout(SHUTDOWN_GRACE, worker_handle).await.is_err() {
        tracing::warn!("ingest worker did not stop in time");
    }

    publisher_handle.abort();
    broadcaster.close_all().await;

    let _ = shutdown_tx.send(());
    if !server_done && tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await.is_err() {
        tracing::warn!("HTTP server did not stop in time");
    }

    store.close().await;
    Ok(())
}
