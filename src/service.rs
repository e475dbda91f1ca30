use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::etl::quality::QualityHistory;
use crate::health::HealthReporter;
use crate::ingest::Ingestor;
use crate::metrics::PipelineMetrics;
use crate::orchestrator::Orchestrator;
use crate::queue::IngestQueue;
use crate::scoring::{FaultScorer, HeuristicScorer};
use crate::store::MeasurementStore;
use crate::writer::{BatchWriter, WriterSettings};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct WriterTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Wires the ingest buffer, the batch writer and the ETL orchestrator around
/// one store. Transports (MQTT, gRPC) only ever see the [`Ingestor`].
pub struct EtlService {
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    ingestor: Ingestor,
    writer: BatchWriter,
    orchestrator: Orchestrator,
    writer_task: tokio::sync::Mutex<Option<WriterTask>>,
}

impl EtlService {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn MeasurementStore>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self::with_scorer(config, store, topic_prefix, Arc::new(HeuristicScorer))
    }

    pub fn with_scorer(
        config: PipelineConfig,
        store: Arc<dyn MeasurementStore>,
        topic_prefix: impl Into<String>,
        scorer: Arc<dyn FaultScorer>,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(IngestQueue::new(config.buffer_size, metrics.clone()));
        let quality = Arc::new(Mutex::new(QualityHistory::new(config.quality_history_len)));
        let health = HealthReporter::new(
            metrics.clone(),
            store.clone(),
            queue.clone(),
            quality.clone(),
            config.report_dir.clone(),
        );
        let ingestor = Ingestor::new(queue.clone(), metrics.clone(), topic_prefix);
        let writer = BatchWriter::new(
            queue,
            store.clone(),
            metrics.clone(),
            WriterSettings::from_config(&config),
        );
        let orchestrator =
            Orchestrator::new(config.clone(), store, metrics.clone(), quality, health, scorer);
        Self {
            config,
            metrics,
            ingestor,
            writer,
            orchestrator,
            writer_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn health(&self) -> &HealthReporter {
        self.orchestrator.health()
    }

    pub async fn start(&self) -> Result<(), PipelineError> {
        self.orchestrator.start().await?;
        let mut task = self.writer_task.lock().await;
        if task.is_none() {
            let cancel = CancellationToken::new();
            let handle = self.writer.clone().start(cancel.clone());
            *task = Some(WriterTask { cancel, handle });
        }
        Ok(())
    }

    /// Stops the writer first so the final health report sees its last
    /// flush, then the ETL loops.
    pub async fn stop(&self) {
        if let Some(WriterTask { cancel, mut handle }) = self.writer_task.lock().await.take() {
            cancel.cancel();
            match tokio::time::timeout(self.config.stop_timeout(), &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "batch writer ended abnormally"),
                Err(_) => {
                    tracing::warn!("batch writer did not stop in time; aborting");
                    handle.abort();
                }
            }
        }
        self.orchestrator.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PipelineStatus;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config() -> PipelineConfig {
        PipelineConfig {
            writer_interval_seconds: 1,
            processing_interval_seconds: 3600,
            retry_delay_ms: 1,
            stop_timeout_seconds: 2,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn readings_flow_from_ingestor_to_store_and_cycle() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let service = EtlService::new(config(), store.clone(), "hermes");
        service.start().await?;
        assert_eq!(service.orchestrator().status(), PipelineStatus::Running);

        let now = chrono::Utc::now().to_rfc3339();
        for idx in 0..5 {
            let mut payload = format!(
                r#"{{"device_id":"ESP32_PUMP_0{idx}","timestamp":"{now}","sensors":{{"temperature":50.0,"humidity":40.0,"pressure":1010.0,"vibration":1.2}}}}"#
            )
            .into_bytes();
            service.ingestor().handle_message("hermes/sensors/data", &mut payload)?;
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.measurement_count() < 5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await?;

        let outcome = service.orchestrator().run_cycle().await;
        assert_eq!(outcome.window_len(), 5, "{outcome:?}");
        assert_eq!(service.metrics().snapshot().records_processed, 5);

        service.stop().await;
        assert_eq!(service.orchestrator().status(), PipelineStatus::Stopped);
        assert!(service.health().latest().is_some());
        Ok(())
    }
}
