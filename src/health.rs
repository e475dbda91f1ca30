use crate::etl::quality::QualityHistory;
use crate::metrics::{MetricsSnapshot, PipelineMetrics, PipelineStatus};
use crate::queue::IngestQueue;
use crate::store::MeasurementStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Number of most recent quality results summarized in a report.
pub const RECENT_QUALITY_WINDOW: usize = 20;

const STORE_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub pipeline_status: PipelineStatus,
    pub store_reachable: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub success_rate: f64,
    pub quality_checks_failed: usize,
    pub uptime_hours: f64,
    pub metrics: MetricsSnapshot,
}

impl HealthReport {
    pub fn file_name(&self) -> String {
        format!("health_report_{}.json", self.generated_at.format("%Y%m%d_%H%M%S"))
    }
}

struct HealthInner {
    metrics: Arc<PipelineMetrics>,
    store: Arc<dyn MeasurementStore>,
    queue: Arc<IngestQueue>,
    quality: Arc<Mutex<QualityHistory>>,
    started: Instant,
    report_dir: Option<PathBuf>,
    latest: RwLock<Option<Arc<HealthReport>>>,
}

/// Builds health snapshots on demand. Reads only atomics and short-held
/// locks, plus one bounded store ping.
#[derive(Clone)]
pub struct HealthReporter {
    inner: Arc<HealthInner>,
}

impl HealthReporter {
    pub fn new(
        metrics: Arc<PipelineMetrics>,
        store: Arc<dyn MeasurementStore>,
        queue: Arc<IngestQueue>,
        quality: Arc<Mutex<QualityHistory>>,
        report_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                metrics,
                store,
                queue,
                quality,
                started: Instant::now(),
                report_dir,
                latest: RwLock::new(None),
            }),
        }
    }

    pub async fn snapshot(&self) -> Arc<HealthReport> {
        let inner = &self.inner;
        let ping = tokio::time::timeout(STORE_PING_TIMEOUT, inner.store.ping()).await;
        let store_reachable = match ping {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "store ping failed");
                false
            }
            Err(_) => {
                tracing::debug!("store ping timed out");
                false
            }
        };

        let metrics = inner.metrics.snapshot();
        let quality_checks_failed = inner
            .quality
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent_failures(RECENT_QUALITY_WINDOW);
        let report = Arc::new(HealthReport {
            generated_at: Utc::now(),
            pipeline_status: metrics.status,
            store_reachable,
            queue_depth: inner.queue.len(),
            queue_capacity: inner.queue.capacity(),
            success_rate: metrics.success_rate(),
            quality_checks_failed,
            uptime_hours: inner.started.elapsed().as_secs_f64() / 3600.0,
            metrics,
        });

        if let Ok(mut latest) = inner.latest.write() {
            *latest = Some(report.clone());
        }
        report
    }

    pub fn latest(&self) -> Option<Arc<HealthReport>> {
        self.inner
            .latest
            .read()
            .ok()
            .and_then(|latest| latest.clone())
    }

    /// Takes a snapshot and, when a report directory is configured, writes it
    /// out as JSON. Sink failures are logged, never propagated.
    pub async fn capture_and_publish(&self) -> Arc<HealthReport> {
        let report = self.snapshot().await;
        if let Some(dir) = self.inner.report_dir.as_deref() {
            match write_report(dir, &report).await {
                Ok(path) => tracing::info!(path = %path.display(), "wrote health report"),
                Err(err) => tracing::warn!(error = %err, "failed to write health report"),
            }
        }
        report
    }
}

async fn write_report(dir: &Path, report: &HealthReport) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(report.file_name());
    let body = serde_json::to_vec_pretty(report)?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::quality::QualityCheckResult;
    use crate::store::MemoryStore;

    type Harness = (HealthReporter, Arc<PipelineMetrics>, Arc<Mutex<QualityHistory>>);

    fn reporter(store: Arc<MemoryStore>, report_dir: Option<PathBuf>) -> Harness {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(IngestQueue::new(16, metrics.clone()));
        let quality = Arc::new(Mutex::new(QualityHistory::new(64)));
        let reporter =
            HealthReporter::new(metrics.clone(), store, queue, quality.clone(), report_dir);
        (reporter, metrics, quality)
    }

    fn check(passed: bool) -> QualityCheckResult {
        QualityCheckResult {
            check_name: "null_ratio".to_string(),
            passed,
            message: String::new(),
            affected_records: 0,
            checked_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_metrics_and_recent_quality() {
        let store = Arc::new(MemoryStore::new());
        let (reporter, metrics, quality) = reporter(store, None);
        metrics.set_status(PipelineStatus::Running);
        metrics.record_flush(10, 9, 1);
        {
            let mut history = quality.lock().expect("history lock");
            history.extend((0..30).map(|idx| check(idx % 3 != 0)));
        }

        let report = reporter.snapshot().await;
        assert_eq!(report.pipeline_status, PipelineStatus::Running);
        assert!(report.store_reachable);
        assert_eq!(report.queue_capacity, 16);
        assert!((report.success_rate - 0.9).abs() < 1e-9);
        // newest 20 entries are idx 10..30; multiples of 3 fail
        assert_eq!(report.quality_checks_failed, 6);
        assert_eq!(reporter.latest().as_deref(), Some(&*report));
    }

    #[tokio::test]
    async fn unreachable_store_is_reported_not_raised() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let (reporter, _metrics, _quality) = reporter(store, None);
        assert!(!reporter.snapshot().await.store_reachable);
    }

    #[tokio::test]
    async fn published_report_lands_in_report_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        let (reporter, _metrics, _quality) = reporter(store, Some(dir.path().join("reports")));

        let report = reporter.capture_and_publish().await;
        let path = dir.path().join("reports").join(report.file_name());
        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(path)?)?;
        assert_eq!(written["pipeline_status"], "STOPPED");
        assert_eq!(written["store_reachable"], true);
        Ok(())
    }
}
