use crate::config::PipelineConfig;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    HealthReport,
    RetentionCleanup,
}

#[derive(Debug, Clone)]
struct Entry {
    task: MaintenanceTask,
    every: Duration,
    next_due: DateTime<Utc>,
}

/// Wall-clock schedule for the maintenance loop. A task that missed several
/// periods (suspended host, long cycle) runs once and is re-armed past `now`.
#[derive(Debug, Clone)]
pub struct MaintenanceSchedule {
    entries: Vec<Entry>,
}

impl MaintenanceSchedule {
    pub fn new(start: DateTime<Utc>, config: &PipelineConfig) -> Self {
        let hourly = Duration::seconds(config.health_report_interval_seconds as i64);
        let retention = Duration::hours(config.retention_interval_hours as i64);
        Self {
            entries: vec![
                Entry {
                    task: MaintenanceTask::HealthReport,
                    every: hourly,
                    next_due: start + hourly,
                },
                Entry {
                    task: MaintenanceTask::RetentionCleanup,
                    every: retention,
                    next_due: start + retention,
                },
            ],
        }
    }

    pub fn next_due(&self, task: MaintenanceTask) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|entry| entry.task == task)
            .map(|entry| entry.next_due)
    }

    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<MaintenanceTask> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.next_due > now {
                continue;
            }
            let every_ms = entry.every.num_milliseconds().max(1);
            let behind_ms = (now - entry.next_due).num_milliseconds();
            let periods = behind_ms / every_ms + 1;
            entry.next_due += Duration::milliseconds(every_ms.saturating_mul(periods));
            due.push(entry.task);
        }
        due
    }
}
