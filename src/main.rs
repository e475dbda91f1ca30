use anyhow::{Context, Result};
use futures::future;
use std::sync::Arc;
use telemetry_etl::config::{Config, StoreBackend};
use telemetry_etl::grpc::{serve_uds, PipelineService};
use telemetry_etl::mqtt;
use telemetry_etl::store::{build_pool, MeasurementStore, MemoryStore, PgStore};
use telemetry_etl::EtlService;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_etl=info".into());
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
                KeyValue::new("service.name", "telemetry-etl"),
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

async fn open_store(config: &Config) -> Result<Arc<dyn MeasurementStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; measurements are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("postgres backend selected without a database url")?;
            let pool = build_pool(url, config.db_pool_size).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let store = open_store(&config).await?;
    let service = EtlService::new(config.pipeline.clone(), store, config.mqtt_topic_prefix.clone());
    service
        .start()
        .await
        .context("failed to start telemetry ETL pipeline")?;

    let shutdown = CancellationToken::new();

    let grpc_handle = config.grpc_socket_path.clone().map(|path| {
        let grpc_service = PipelineService::new(
            service.ingestor().clone(),
            service.orchestrator().clone(),
        );
        let cancel = shutdown.clone();
        tokio::spawn(async move { serve_uds(&path, grpc_service, cancel).await })
    });

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let ingestor = service.ingestor().clone();
        let metrics = service.metrics().clone();
        let cancel = shutdown.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, ingestor, metrics, cancel).await
        }))
    } else {
        None
    };

    tokio::select! {
        res = async {
            match grpc_handle {
                Some(handle) => handle.await,
                None => future::pending().await,
            }
        } => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "gRPC server failed"),
                Err(err) => tracing::error!(error=%err, "gRPC task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                if let Err(err) = handle.await { tracing::warn!(error=%err, "MQTT task failed"); }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    service.stop().await;

    Ok(())
}
