mod schedule;


pub use schedule::{MaintenanceSchedule, MaintenanceTask};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::etl::aggregate::{aggregate_window, AggregationSet};
use crate::etl::quality::{QualityConfig, QualityGate, QualityHistory, WindowVerdict};
use crate::etl::transform::{transform_window, TransformConfig};
use crate::export::export_cycle;
use crate::health::HealthReporter;
use crate::metrics::{PipelineMetrics, PipelineStatus};
use crate::retry::RetryPolicy;
use crate::scoring::{score_latest, AlertLevel, FaultScorer};
use crate::store::MeasurementStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const HIGH_ERROR_COUNT: u64 = 10;

/// Inputs shared by every stage of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleContext {
    pub cycle: u64,
    pub now: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        window_len: usize,
        verdict: WindowVerdict,
        predictions: usize,
        alerts: usize,
    },
    /// Nothing in the window; status and abort streak are left untouched.
    EmptyWindow,
    Aborted {
        reason: String,
    },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Completed { .. } => "completed",
            CycleOutcome::EmptyWindow => "empty_window",
            CycleOutcome::Aborted { .. } => "aborted",
        }
    }

    pub fn window_len(&self) -> usize {
        match self {
            CycleOutcome::Completed { window_len, .. } => *window_len,
            _ => 0,
        }
    }
}

struct RunningLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct OrchestratorInner {
    config: PipelineConfig,
    store: Arc<dyn MeasurementStore>,
    metrics: Arc<PipelineMetrics>,
    health: HealthReporter,
    scorer: Arc<dyn FaultScorer>,
    quality: Arc<Mutex<QualityHistory>>,
    gate: QualityGate,
    transform: TransformConfig,
    retry: RetryPolicy,
    latest: RwLock<Option<Arc<AggregationSet>>>,
    cycle_seq: std::sync::atomic::AtomicU64,
    cycle_lock: tokio::sync::Mutex<()>,
    running: tokio::sync::Mutex<Option<RunningLoops>>,
}

/// Owns the ETL cycle: extract, quality gate, transform, aggregate, export.
/// Also drives the maintenance schedule and the pipeline status machine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn MeasurementStore>,
        metrics: Arc<PipelineMetrics>,
        quality: Arc<Mutex<QualityHistory>>,
        health: HealthReporter,
        scorer: Arc<dyn FaultScorer>,
    ) -> Self {
        let gate = QualityGate::new(QualityConfig {
            null_ratio_threshold: config.null_ratio_threshold,
            reject_threshold: config.quality_reject_threshold,
            ..QualityConfig::default()
        });
        let retry = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                store,
                metrics,
                health,
                scorer,
                quality,
                gate,
                transform: TransformConfig::default(),
                retry,
                latest: RwLock::new(None),
                cycle_seq: std::sync::atomic::AtomicU64::new(0),
                cycle_lock: tokio::sync::Mutex::new(()),
                running: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.metrics.status()
    }

    pub fn health(&self) -> &HealthReporter {
        &self.inner.health
    }

    /// The last successfully exported aggregation set.
    pub fn latest_aggregates(&self) -> Option<Arc<AggregationSet>> {
        self.inner
            .latest
            .read()
            .ok()
            .and_then(|latest| latest.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Validates the configuration, ensures the schema, flips status to RUNNING
    /// and launches the cycle and maintenance loops. Calling it while already
    /// running is a no-op.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.inner.config.validate()?;
        let cancel = CancellationToken::new();
        let store = &self.inner.store;
        self.inner
            .retry
            .run("ensure_schema", &cancel, move || store.ensure_schema())
            .await?;

        self.inner.metrics.consecutive_aborts.store(0, Ordering::Relaxed);
        self.inner.metrics.set_status(PipelineStatus::Running);
        let handles = vec![
            self.spawn_cycle_loop(cancel.clone()),
            self.spawn_maintenance_loop(cancel.clone()),
        ];
        *running = Some(RunningLoops { cancel, handles });
        tracing::info!(
            interval_seconds = self.inner.config.processing_interval_seconds,
            "pipeline started"
        );
        Ok(())
    }

    /// Signals both loops and waits for them up to the stop timeout; a loop
    /// still busy after that is aborted. Ends with a final health report.
    pub async fn stop(&self) {
        let Some(loops) = self.inner.running.lock().await.take() else {
            return;
        };
        tracing::info!("stopping pipeline");
        loops.cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.inner.config.stop_timeout();
        for mut handle in loops.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "pipeline loop ended abnormally"),
                Err(_) => {
                    tracing::warn!(
                        timeout_seconds = self.inner.config.stop_timeout_seconds,
                        "pipeline loop did not stop in time; aborting"
                    );
                    handle.abort();
                }
            }
        }

        self.inner.metrics.set_status(PipelineStatus::Stopped);
        let report = self.inner.health.capture_and_publish().await;
        tracing::info!(
            records_processed = report.metrics.records_processed,
            cycles_completed = report.metrics.cycles_completed,
            "pipeline stopped"
        );
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs one cycle as if the clock read `now`. Cycles never overlap.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        self.run_cycle_with(now, &CancellationToken::new()).await
    }

    async fn run_cycle_with(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> CycleOutcome {
        let _guard = self.inner.cycle_lock.lock().await;
        let started = Instant::now();
        let ctx = CycleContext {
            cycle: self.inner.cycle_seq.fetch_add(1, Ordering::Relaxed) + 1,
            now,
            window_start: now - self.inner.config.extract_window(),
        };

        let outcome = self.execute(&ctx, cancel).await;
        self.settle(&ctx, &outcome);
        if matches!(outcome, CycleOutcome::Completed { .. }) {
            self.inner.metrics.record_cycle_duration(started.elapsed());
        }
        tracing::info!(
            cycle = ctx.cycle,
            outcome = outcome.label(),
            records = outcome.window_len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = self.status().as_str(),
            "cycle finished"
        );
        outcome
    }

    async fn execute(&self, ctx: &CycleContext, cancel: &CancellationToken) -> CycleOutcome {
        let inner = &self.inner;
        let store = &inner.store;

        let since = ctx.window_start;
        let window = match inner
            .retry
            .run("extract_window", cancel, move || store.extract_window(since))
            .await
        {
            Ok(window) => window,
            Err(err) => {
                return CycleOutcome::Aborted {
                    reason: format!("extract failed: {err}"),
                }
            }
        };
        if window.is_empty() {
            tracing::info!(
                cycle = ctx.cycle,
                since = %ctx.window_start,
                "no measurements in window"
            );
            return CycleOutcome::EmptyWindow;
        }

        let report = inner.gate.evaluate(&window, ctx.now);
        inner
            .quality
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(report.checks.iter().cloned());
        for check in report.failed_checks() {
            tracing::warn!(
                cycle = ctx.cycle,
                check = %check.check_name,
                affected = check.affected_records,
                message = %check.message,
                "quality check failed"
            );
        }
        if report.verdict == WindowVerdict::Rejected {
            let err = PipelineError::QualityRejected {
                window_len: window.len(),
                failed_checks: report.failed_names(),
            };
            return CycleOutcome::Aborted {
                reason: err.to_string(),
            };
        }

        let transformed = transform_window(&window, &inner.transform);
        tracing::debug!(
            cycle = ctx.cycle,
            imputed = transformed.imputed,
            clipped = transformed.clipped,
            "transformed window"
        );

        let mut set = aggregate_window(
            &transformed.records,
            &inner.gate.config().monitored,
            ctx.window_start,
            ctx.now,
        );
        set.predictions = score_latest(&transformed.records, inner.scorer.as_ref());
        let alerts = set
            .predictions
            .iter()
            .filter(|prediction| prediction.alert_level == AlertLevel::High)
            .inspect(|prediction| {
                tracing::warn!(
                    device = %prediction.device_id,
                    probability = prediction.fault_probability,
                    "high fault probability"
                );
            })
            .count();

        let pending = &set;
        if let Err(err) = inner
            .retry
            .run("replace_aggregates", cancel, move || store.replace_aggregates(pending))
            .await
        {
            return CycleOutcome::Aborted {
                reason: format!("export failed: {err}"),
            };
        }
        for (view, rows) in set.view_sizes() {
            tracing::debug!(cycle = ctx.cycle, view, rows, "exported view");
        }
        if let Some(dir) = inner.config.export_dir.as_deref() {
            match export_cycle(dir, &transformed.records, &set).await {
                Ok(files) => tracing::info!(
                    cycle = ctx.cycle,
                    files = files.len(),
                    dir = %dir.display(),
                    "exported cycle files"
                ),
                Err(err) => {
                    tracing::warn!(cycle = ctx.cycle, error = %err, "failed to export cycle files")
                }
            }
        }

        let predictions = set.predictions.len();
        if let Ok(mut latest) = inner.latest.write() {
            *latest = Some(Arc::new(set));
        }

        CycleOutcome::Completed {
            window_len: window.len(),
            verdict: report.verdict,
            predictions,
            alerts,
        }
    }

    /// Applies a cycle outcome to the counters and the status machine.
    /// STOPPED is only left through `start`.
    fn settle(&self, ctx: &CycleContext, outcome: &CycleOutcome) {
        let metrics = &self.inner.metrics;
        match outcome {
            CycleOutcome::Completed {
                window_len,
                predictions,
                alerts,
                ..
            } => {
                metrics.cycles_completed.fetch_add(1, Ordering::Relaxed);
                metrics
                    .cycle_records_processed
                    .fetch_add(*window_len as u64, Ordering::Relaxed);
                metrics
                    .predictions_emitted
                    .fetch_add(*predictions as u64, Ordering::Relaxed);
                metrics.alerts_emitted.fetch_add(*alerts as u64, Ordering::Relaxed);
                metrics.consecutive_aborts.store(0, Ordering::Relaxed);
                if metrics.status() == PipelineStatus::Degraded {
                    metrics.set_status(PipelineStatus::Running);
                    tracing::info!(cycle = ctx.cycle, "pipeline recovered");
                }
            }
            CycleOutcome::EmptyWindow => {}
            CycleOutcome::Aborted { reason } => {
                metrics.cycles_aborted.fetch_add(1, Ordering::Relaxed);
                metrics.errors_count.fetch_add(1, Ordering::Relaxed);
                metrics.record_error(reason.clone());
                let streak = metrics.consecutive_aborts.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(cycle = ctx.cycle, streak, reason = %reason, "cycle aborted");
                if streak >= self.inner.config.degraded_after_aborts
                    && metrics.status() == PipelineStatus::Running
                {
                    metrics.set_status(PipelineStatus::Degraded);
                    tracing::warn!(streak, "pipeline degraded");
                }
            }
        }
    }

    fn spawn_cycle_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let period = this.inner.config.processing_interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.run_cycle_with(Utc::now(), &cancel).await;
                    }
                }
            }
        })
    }

    fn spawn_maintenance_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut schedule = MaintenanceSchedule::new(Utc::now(), &this.inner.config);
            let mut ticker = tokio::time::interval(this.inner.config.maintenance_poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for task in schedule.due(Utc::now()) {
                            this.run_maintenance(task, &cancel).await;
                        }
                        let errors = this.inner.metrics.errors_count.load(Ordering::Relaxed);
                        if errors > HIGH_ERROR_COUNT {
                            tracing::warn!(errors, "high pipeline error count");
                        }
                    }
                }
            }
        })
    }

    pub async fn run_maintenance(&self, task: MaintenanceTask, cancel: &CancellationToken) {
        match task {
            MaintenanceTask::HealthReport => {
                let report = self.inner.health.capture_and_publish().await;
                tracing::info!(
                    status = report.pipeline_status.as_str(),
                    success_rate = report.success_rate,
                    queue_depth = report.queue_depth,
                    "health report"
                );
            }
            MaintenanceTask::RetentionCleanup => {
                let cutoff =
                    Utc::now() - chrono::Duration::days(self.inner.config.retention_days as i64);
                let store = &self.inner.store;
                match self
                    .inner
                    .retry
                    .run("purge_before", cancel, move || store.purge_before(cutoff))
                    .await
                {
                    Ok(removed) => {
                        tracing::info!(removed, cutoff = %cutoff, "purged expired measurements")
                    }
                    Err(err) => {
                        self.inner.metrics.errors_count.fetch_add(1, Ordering::Relaxed);
                        self.inner.metrics.record_error(err.to_string());
                        tracing::warn!(error = %err, "retention cleanup failed");
                    }
                }
            }
        }
    }
}
