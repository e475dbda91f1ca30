use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::queue::IngestQueue;
use crate::reading::{decode_reading, DEFAULT_SOURCE};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    SensorData,
    Status,
    Heartbeat,
    Other,
}

/// `<prefix>/sensors/data`, `<prefix>/sensors/status`, `<prefix>/<node>/heartbeat`.
pub fn classify_topic(prefix: &str, topic: &str) -> TopicKind {
    let Some(rest) = topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return TopicKind::Other;
    };
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        ["sensors", "data"] => TopicKind::SensorData,
        ["sensors", "status"] => TopicKind::Status,
        [node, "heartbeat"] if !node.is_empty() => TopicKind::Heartbeat,
        _ => TopicKind::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued { depth: usize },
    Logged(TopicKind),
}

/// Entry point for every inbound message, whatever transport carried it.
#[derive(Clone)]
pub struct Ingestor {
    queue: Arc<IngestQueue>,
    metrics: Arc<PipelineMetrics>,
    topic_prefix: String,
}

impl Ingestor {
    pub fn new(
        queue: Arc<IngestQueue>,
        metrics: Arc<PipelineMetrics>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            metrics,
            topic_prefix: topic_prefix.into(),
        }
    }

    pub fn queue(&self) -> &Arc<IngestQueue> {
        &self.queue
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    /// Routes by topic. Sensor data is decoded and queued; status and
    /// heartbeat traffic is only logged. The payload buffer is parsed in
    /// place and left clobbered.
    pub fn handle_message(
        &self,
        topic: &str,
        payload: &mut [u8],
    ) -> Result<IngestOutcome, PipelineError> {
        match classify_topic(&self.topic_prefix, topic) {
            TopicKind::SensorData => self
                .ingest_reading(topic, payload)
                .map(|depth| IngestOutcome::Queued { depth }),
            kind @ (TopicKind::Status | TopicKind::Heartbeat) => {
                log_device_event(kind, topic, payload);
                Ok(IngestOutcome::Logged(kind))
            }
            TopicKind::Other => {
                tracing::debug!(topic, "ignoring message on unrecognized topic");
                Ok(IngestOutcome::Logged(TopicKind::Other))
            }
        }
    }

    pub fn ingest_reading(&self, topic: &str, payload: &mut [u8]) -> Result<usize, PipelineError> {
        self.metrics.readings_received.fetch_add(1, Ordering::Relaxed);
        let reading = match decode_reading(topic, payload, DEFAULT_SOURCE) {
            Ok(reading) => reading,
            Err(err) => {
                self.metrics.readings_malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic, error = %err, "discarding malformed reading");
                return Err(err.into());
            }
        };
        let device = reading.device_id.clone();
        let depth = self.queue.try_enqueue(reading)?;
        tracing::debug!(topic, device = %device, queue_depth = depth, "accepted reading");
        Ok(depth)
    }
}

fn log_device_event(kind: TopicKind, topic: &str, payload: &mut [u8]) {
    let Ok(BorrowedValue::Object(obj)) = simd_json::to_borrowed_value(payload) else {
        tracing::debug!(topic, ?kind, "unparseable device event");
        return;
    };
    let device = obj
        .get("device_id")
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown");
    match kind {
        TopicKind::Status => {
            let status = obj
                .get("status")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown");
            tracing::info!(topic, device, status, "device status");
        }
        _ => tracing::debug!(topic, device, "device heartbeat"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingestor(capacity: usize) -> (Ingestor, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(IngestQueue::new(capacity, metrics.clone()));
        (Ingestor::new(queue, metrics.clone(), "hermes"), metrics)
    }

    fn payload(device: &str) -> Vec<u8> {
        format!(
            r#"{{"device_id":"{device}","timestamp":"2026-03-01T12:00:00Z","sensors":{{"temperature":42.5}}}}"#
        )
        .into_bytes()
    }

    #[test]
    fn topics_route_by_shape() {
        assert_eq!(classify_topic("hermes", "hermes/sensors/data"), TopicKind::SensorData);
        assert_eq!(classify_topic("hermes", "hermes/sensors/status"), TopicKind::Status);
        assert_eq!(classify_topic("hermes", "hermes/esp32-7/heartbeat"), TopicKind::Heartbeat);
        assert_eq!(classify_topic("hermes", "hermes/sensors/data/extra"), TopicKind::Other);
        assert_eq!(classify_topic("hermes", "other/sensors/data"), TopicKind::Other);
        assert_eq!(classify_topic("hermes", "hermesx/sensors/data"), TopicKind::Other);
    }

    #[test]
    fn sensor_data_is_queued_and_counted() -> anyhow::Result<()> {
        let (ingestor, metrics) = ingestor(10);
        let outcome = ingestor.handle_message("hermes/sensors/data", &mut payload("ESP32_A"))?;
        assert_eq!(outcome, IngestOutcome::Queued { depth: 1 });
        assert_eq!(metrics.snapshot().readings_received, 1);
        Ok(())
    }

    #[test]
    fn malformed_payload_is_counted_and_not_queued() {
        let (ingestor, metrics) = ingestor(10);
        let mut bad =
            br#"{"timestamp":"2026-03-01T12:00:00Z","sensors":{"temperature":1}}"#.to_vec();
        let err = ingestor
            .handle_message("hermes/sensors/data", &mut bad)
            .expect_err("missing device id");
        assert!(matches!(err, PipelineError::MalformedReading(_)));
        assert!(ingestor.queue().is_empty());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.readings_malformed, 1);
        assert_eq!(snapshot.records_failed, 0);
    }

    #[test]
    fn overflow_surfaces_as_queue_overflow() -> anyhow::Result<()> {
        let (ingestor, metrics) = ingestor(1);
        ingestor.handle_message("hermes/sensors/data", &mut payload("ESP32_A"))?;
        let err = ingestor
            .handle_message("hermes/sensors/data", &mut payload("ESP32_B"))
            .expect_err("queue full");
        assert!(matches!(err, PipelineError::QueueOverflow { capacity: 1 }));
        assert_eq!(metrics.snapshot().records_failed, 1);
        Ok(())
    }

    #[test]
    fn status_and_heartbeat_are_not_queued() -> anyhow::Result<()> {
        let (ingestor, metrics) = ingestor(10);
        let mut status = br#"{"device_id":"ESP32_A","status":"online"}"#.to_vec();
        assert_eq!(
            ingestor.handle_message("hermes/sensors/status", &mut status)?,
            IngestOutcome::Logged(TopicKind::Status)
        );
        let mut beat = b"not json".to_vec();
        assert_eq!(
            ingestor.handle_message("hermes/esp32-a/heartbeat", &mut beat)?,
            IngestOutcome::Logged(TopicKind::Heartbeat)
        );
        assert!(ingestor.queue().is_empty());
        assert_eq!(metrics.snapshot().readings_received, 0);
        Ok(())
    }
}
