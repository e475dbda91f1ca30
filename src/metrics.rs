use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Stopped,
    Running,
    Degraded,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Stopped => "STOPPED",
            PipelineStatus::Running => "RUNNING",
            PipelineStatus::Degraded => "DEGRADED",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PipelineStatus::Running,
            2 => PipelineStatus::Degraded,
            _ => PipelineStatus::Stopped,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            PipelineStatus::Stopped => 0,
            PipelineStatus::Running => 1,
            PipelineStatus::Degraded => 2,
        }
    }
}

/// Process-wide pipeline counters. Every field is updated through atomics so
/// the ingest path, the batch writer and the ETL loop never contend on a lock;
/// readers take a [`MetricsSnapshot`] copy.
#[derive(Debug)]
pub struct PipelineMetrics {
    pub readings_received: AtomicU64,
    pub readings_malformed: AtomicU64,
    pub readings_dropped: AtomicU64,
    pub records_processed: AtomicU64,
    pub records_failed: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub last_flush_unix_ms: AtomicI64,
    pub cycles_completed: AtomicU64,
    pub cycles_aborted: AtomicU64,
    pub consecutive_aborts: AtomicU32,
    pub cycle_records_processed: AtomicU64,
    pub predictions_emitted: AtomicU64,
    pub alerts_emitted: AtomicU64,
    pub errors_count: AtomicU64,
    pub average_cycle_micros: AtomicU64,
    pub last_cycle_unix_ms: AtomicI64,
    pub source_connected: AtomicBool,
    status: AtomicU8,
    last_error: Mutex<Option<String>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            readings_received: AtomicU64::new(0),
            readings_malformed: AtomicU64::new(0),
            readings_dropped: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            last_flush_unix_ms: AtomicI64::new(0),
            cycles_completed: AtomicU64::new(0),
            cycles_aborted: AtomicU64::new(0),
            consecutive_aborts: AtomicU32::new(0),
            cycle_records_processed: AtomicU64::new(0),
            predictions_emitted: AtomicU64::new(0),
            alerts_emitted: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            average_cycle_micros: AtomicU64::new(0),
            last_cycle_unix_ms: AtomicI64::new(0),
            source_connected: AtomicBool::new(false),
            status: AtomicU8::new(PipelineStatus::Stopped.to_u8()),
            last_error: Mutex::new(None),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: PipelineStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn record_flush(&self, batch_len: usize, persisted: usize, failed: usize) {
        self.records_processed
            .fetch_add(persisted as u64, Ordering::Relaxed);
        self.records_failed.fetch_add(failed as u64, Ordering::Relaxed);
        self.last_batch_len
            .store(batch_len as u64, Ordering::Relaxed);
        self.last_flush_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Same running average the batch flush stats use: the first sample seeds
    /// it, later samples are halved in.
    pub fn record_cycle_duration(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let prev = self.average_cycle_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 {
            micros.max(1)
        } else {
            (prev + micros) / 2
        };
        self.average_cycle_micros.store(avg, Ordering::Relaxed);
        self.last_cycle_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let last_cycle_ms = self.last_cycle_unix_ms.load(Ordering::Relaxed);
        let last_flush_ms = self.last_flush_unix_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            status: self.status(),
            readings_received: load(&self.readings_received),
            readings_malformed: load(&self.readings_malformed),
            readings_dropped: load(&self.readings_dropped),
            records_processed: load(&self.records_processed),
            records_failed: load(&self.records_failed),
            last_batch_len: load(&self.last_batch_len),
            last_flush_at: unix_ms_to_dt(last_flush_ms),
            cycles_completed: load(&self.cycles_completed),
            cycles_aborted: load(&self.cycles_aborted),
            consecutive_aborts: self.consecutive_aborts.load(Ordering::Relaxed),
            cycle_records_processed: load(&self.cycle_records_processed),
            predictions_emitted: load(&self.predictions_emitted),
            alerts_emitted: load(&self.alerts_emitted),
            errors_count: load(&self.errors_count),
            average_cycle_ms: load(&self.average_cycle_micros) as f64 / 1000.0,
            last_cycle_at: unix_ms_to_dt(last_cycle_ms),
            source_connected: self.source_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

fn unix_ms_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub status: PipelineStatus,
    pub readings_received: u64,
    pub readings_malformed: u64,
    pub readings_dropped: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub last_batch_len: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub cycles_completed: u64,
    pub cycles_aborted: u64,
    pub consecutive_aborts: u32,
    pub cycle_records_processed: u64,
    pub predictions_emitted: u64,
    pub alerts_emitted: u64,
    pub errors_count: u64,
    pub average_cycle_ms: f64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub source_connected: bool,
    pub last_error: Option<String>,
}

impl MetricsSnapshot {
    pub fn success_rate(&self) -> f64 {
        let total = self.records_processed + self.records_failed;
        if total == 0 {
            return 1.0;
        }
        self.records_processed as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_atomic() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.status(), PipelineStatus::Stopped);
        metrics.set_status(PipelineStatus::Degraded);
        assert_eq!(metrics.snapshot().status, PipelineStatus::Degraded);
    }

    #[test]
    fn success_rate_defaults_to_one_without_traffic() {
        let metrics = PipelineMetrics::new();
        assert_eq!(metrics.snapshot().success_rate(), 1.0);
        metrics.record_flush(4, 3, 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_processed, 3);
        assert_eq!(snapshot.last_batch_len, 4);
        assert!((snapshot.success_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn cycle_average_halves_new_samples_in() {
        let metrics = PipelineMetrics::new();
        metrics.record_cycle_duration(Duration::from_millis(100));
        metrics.record_cycle_duration(Duration::from_millis(300));
        assert!((metrics.snapshot().average_cycle_ms - 200.0).abs() < 1e-9);
        assert!(metrics.snapshot().last_cycle_at.is_some());
    }
}
