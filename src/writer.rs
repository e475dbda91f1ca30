use crate::config::PipelineConfig;
use crate::metrics::PipelineMetrics;
use crate::queue::IngestQueue;
use crate::retry::RetryPolicy;
use crate::store::{MeasurementStore, NewMeasurement};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriterSettings {
    pub batch_size: usize,
    pub interval: Duration,
    pub retry: RetryPolicy,
}

impl WriterSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_insert_size.max(1),
            interval: config.writer_interval(),
            // Inserts are not idempotent: a timed-out attempt may have committed.
            retry: RetryPolicy::from_config(config).without_timeout_retry(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub total: usize,
    pub persisted: usize,
    pub failed: usize,
}

/// Drains the ingest queue on a fixed interval and persists each reading in
/// its own transaction. One bad reading never takes the rest of the batch
/// down with it.
#[derive(Clone)]
pub struct BatchWriter {
    queue: Arc<IngestQueue>,
    store: Arc<dyn MeasurementStore>,
    metrics: Arc<PipelineMetrics>,
    settings: WriterSettings,
}

impl BatchWriter {
    pub fn new(
        queue: Arc<IngestQueue>,
        store: Arc<dyn MeasurementStore>,
        metrics: Arc<PipelineMetrics>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            queue,
            store,
            metrics,
            settings,
        }
    }

    /// Runs until `cancel` fires. A flush already in progress completes its
    /// current transaction; readings still queued stay queued.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush_once(&cancel).await;
                    }
                }
            }
            tracing::debug!(queued = self.queue.len(), "batch writer stopped");
        })
    }

    pub async fn flush_once(&self, cancel: &CancellationToken) -> FlushSummary {
        let batch = self.queue.drain(self.settings.batch_size);
        if batch.is_empty() {
            return FlushSummary::default();
        }

        let started = Instant::now();
        let mut summary = FlushSummary {
            total: batch.len(),
            ..FlushSummary::default()
        };
        for reading in &batch {
            let measurement = NewMeasurement::from_reading(reading);
            let (store, pending) = (&self.store, &measurement);
            let result = self
                .settings
                .retry
                .run("persist_reading", cancel, move || store.persist_reading(pending))
                .await;
            match result {
                Ok(id) => {
                    summary.persisted += 1;
                    tracing::trace!(id, device = %reading.device_id, "persisted reading");
                }
                Err(err) => {
                    summary.failed += 1;
                    self.metrics.record_error(err.to_string());
                    tracing::warn!(
                        device = %reading.device_id,
                        captured_at = %reading.captured_at,
                        error = %err,
                        "failed to persist reading"
                    );
                }
            }
        }

        self.metrics
            .record_flush(summary.total, summary.persisted, summary.failed);
        if summary.failed == 0 {
            self.metrics.clear_error();
        }
        tracing::info!(
            successful = summary.persisted,
            total = summary.total,
            micros = started.elapsed().as_micros() as u64,
            "flushed reading batch"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{Channel, ChannelMap, SensorReading};
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn reading(device: &str) -> SensorReading {
        SensorReading {
            device_id: device.to_string(),
            location: "Factory_A".to_string(),
            equipment_type: "Pump".to_string(),
            captured_at: Utc::now(),
            channels: ChannelMap::default().with(Channel::Temperature, 55.0),
            fault_detected: false,
            source: "test".to_string(),
        }
    }

    fn settings(batch_size: usize) -> WriterSettings {
        WriterSettings {
            batch_size,
            interval: Duration::from_millis(10),
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(1),
                attempt_timeout: Duration::from_millis(500),
                retry_timeouts: false,
            },
        }
    }

    type Harness = (Arc<IngestQueue>, Arc<MemoryStore>, Arc<PipelineMetrics>, BatchWriter);

    fn fixture(batch_size: usize) -> Harness {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(IngestQueue::new(100, metrics.clone()));
        let store = Arc::new(MemoryStore::new());
        let writer =
            BatchWriter::new(queue.clone(), store.clone(), metrics.clone(), settings(batch_size));
        (queue, store, metrics, writer)
    }

    #[tokio::test]
    async fn flush_takes_at_most_one_batch() -> anyhow::Result<()> {
        let (queue, store, metrics, writer) = fixture(3);
        for idx in 0..5 {
            queue.try_enqueue(reading(&format!("ESP32_D{idx}")))?;
        }

        let summary = writer.flush_once(&CancellationToken::new()).await;
        assert_eq!(summary, FlushSummary { total: 3, persisted: 3, failed: 0 });
        assert_eq!(queue.len(), 2);
        assert_eq!(store.measurement_count(), 3);
        assert_eq!(metrics.snapshot().records_processed, 3);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_the_flush() -> anyhow::Result<()> {
        let (queue, store, metrics, writer) = fixture(10);
        queue.try_enqueue(reading("ESP32_A"))?;
        store.fail_next(2);

        let summary = writer.flush_once(&CancellationToken::new()).await;
        assert_eq!(summary.persisted, 1);
        assert_eq!(metrics.snapshot().records_failed, 0);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_count_reading_as_failed() -> anyhow::Result<()> {
        let (queue, store, metrics, writer) = fixture(10);
        queue.try_enqueue(reading("ESP32_A"))?;
        queue.try_enqueue(reading("ESP32_B"))?;
        store.fail_next(3);

        let summary = writer.flush_once(&CancellationToken::new()).await;
        assert_eq!(summary, FlushSummary { total: 2, persisted: 1, failed: 1 });
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_failed, 1);
        assert!(snapshot.last_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn loop_persists_on_interval_and_stops_on_cancel() -> anyhow::Result<()> {
        let (queue, store, _metrics, writer) = fixture(10);
        queue.try_enqueue(reading("ESP32_A"))?;
        let cancel = CancellationToken::new();
        let handle = writer.start(cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.measurement_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await??;
        Ok(())
    }

    #[tokio::test]
    async fn committed_insert_that_times_out_is_not_written_twice() -> anyhow::Result<()> {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(IngestQueue::new(100, metrics.clone()));
        let store = Arc::new(MemoryStore::new());
        let config = PipelineConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            transaction_timeout_ms: 20,
            ..PipelineConfig::default()
        };
        let writer = BatchWriter::new(
            queue.clone(),
            store.clone(),
            metrics.clone(),
            WriterSettings::from_config(&config),
        );
        queue.try_enqueue(reading("ESP32_A"))?;
        store.set_ack_delay(Duration::from_millis(200));

        let summary = writer.flush_once(&CancellationToken::new()).await;
        assert_eq!(summary, FlushSummary { total: 1, persisted: 0, failed: 1 });
        assert_eq!(store.measurement_count(), 1);
        assert!(metrics.snapshot().last_error.is_some());
        Ok(())
    }
}
