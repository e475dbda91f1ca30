use crate::reading::Channel;
use crate::store::MeasurementRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

pub const CHECK_NULL_RATIO: &str = "null_ratio";
pub const CHECK_DUPLICATES: &str = "duplicates";
pub const CHECK_FUTURE_TIMESTAMPS: &str = "future_timestamps";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityCheckResult {
    pub check_name: String,
    pub passed: bool,
    pub message: String,
    pub affected_records: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowVerdict {
    Accepted,
    /// At least one check failed, none badly enough to reject.
    Degraded,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRule {
    pub channel: Channel,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub monitored: Vec<Channel>,
    pub null_ratio_threshold: f64,
    pub reject_threshold: f64,
    pub ranges: Vec<RangeRule>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            monitored: vec![
                Channel::Temperature,
                Channel::Humidity,
                Channel::Pressure,
                Channel::Vibration,
            ],
            null_ratio_threshold: 0.1,
            reject_threshold: 0.2,
            ranges: vec![
                RangeRule {
                    channel: Channel::Temperature,
                    min: -50.0,
                    max: 200.0,
                },
                RangeRule {
                    channel: Channel::Humidity,
                    min: 0.0,
                    max: 100.0,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub window_len: usize,
    pub checks: Vec<QualityCheckResult>,
    pub verdict: WindowVerdict,
}

impl QualityReport {
    pub fn failed_checks(&self) -> impl Iterator<Item = &QualityCheckResult> {
        self.checks.iter().filter(|check| !check.passed)
    }

    /// Comma-separated names of failed checks, for logs and errors.
    pub fn failed_names(&self) -> String {
        self.failed_checks()
            .map(|check| check.check_name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Runs every check over the window. The window is rejected when any
    /// failed check affects strictly more than `reject_threshold` of it.
    pub fn evaluate(&self, window: &[MeasurementRecord], now: DateTime<Utc>) -> QualityReport {
        let mut checks = Vec::with_capacity(3 + self.config.ranges.len());
        checks.push(self.check_null_ratio(window, now));
        for rule in &self.config.ranges {
            checks.push(check_range(window, rule, now));
        }
        checks.push(check_duplicates(window, now));
        checks.push(check_future_timestamps(window, now));

        let limit = self.config.reject_threshold * window.len() as f64;
        let verdict = if checks
            .iter()
            .any(|check| !check.passed && check.affected_records as f64 > limit)
        {
            WindowVerdict::Rejected
        } else if checks.iter().any(|check| !check.passed) {
            WindowVerdict::Degraded
        } else {
            WindowVerdict::Accepted
        };

        QualityReport {
            window_len: window.len(),
            checks,
            verdict,
        }
    }

    fn check_null_ratio(
        &self,
        window: &[MeasurementRecord],
        now: DateTime<Utc>,
    ) -> QualityCheckResult {
        let len = window.len();
        let mut worst: Option<(Channel, f64)> = None;
        for channel in &self.config.monitored {
            let nulls = window
                .iter()
                .filter(|record| record.channels.get(*channel).is_none())
                .count();
            let ratio = if len == 0 { 0.0 } else { nulls as f64 / len as f64 };
            if worst.map_or(true, |(_, current)| ratio > current) {
                worst = Some((*channel, ratio));
            }
        }
        let affected = window
            .iter()
            .filter(|record| {
                self.config
                    .monitored
                    .iter()
                    .any(|channel| record.channels.get(*channel).is_none())
            })
            .count();

        let (passed, message) = match worst {
            Some((channel, ratio)) if ratio >= self.config.null_ratio_threshold => (
                false,
                format!(
                    "{channel} is {:.1}% null (limit {:.1}%)",
                    ratio * 100.0,
                    self.config.null_ratio_threshold * 100.0
                ),
            ),
            Some((channel, ratio)) => (
                true,
                format!("worst column {channel} is {:.1}% null", ratio * 100.0),
            ),
            None => (true, "no monitored columns".to_string()),
        };

        QualityCheckResult {
            check_name: CHECK_NULL_RATIO.to_string(),
            passed,
            message,
            affected_records: if passed { 0 } else { affected },
            checked_at: now,
        }
    }
}

fn check_range(
    window: &[MeasurementRecord],
    rule: &RangeRule,
    now: DateTime<Utc>,
) -> QualityCheckResult {
    let affected = window
        .iter()
        .filter_map(|record| record.channels.get(rule.channel))
        .filter(|value| *value < rule.min || *value > rule.max)
        .count();
    QualityCheckResult {
        check_name: format!("range:{}", rule.channel),
        passed: affected == 0,
        message: format!(
            "{affected} value(s) outside [{}, {}]",
            rule.min, rule.max
        ),
        affected_records: affected,
        checked_at: now,
    }
}

fn check_duplicates(window: &[MeasurementRecord], now: DateTime<Utc>) -> QualityCheckResult {
    let mut seen = HashSet::with_capacity(window.len());
    let affected = window.iter().filter(|record| !seen.insert(record.id)).count();
    QualityCheckResult {
        check_name: CHECK_DUPLICATES.to_string(),
        passed: affected == 0,
        message: format!("{affected} duplicate record id(s)"),
        affected_records: affected,
        checked_at: now,
    }
}

fn check_future_timestamps(window: &[MeasurementRecord], now: DateTime<Utc>) -> QualityCheckResult {
    let affected = window.iter().filter(|record| record.captured_at > now).count();
    QualityCheckResult {
        check_name: CHECK_FUTURE_TIMESTAMPS.to_string(),
        passed: affected == 0,
        message: format!("{affected} record(s) captured after {}", now.to_rfc3339()),
        affected_records: affected,
        checked_at: now,
    }
}

/// Bounded log of recent check results, oldest first.
#[derive(Debug, Clone)]
pub struct QualityHistory {
    entries: VecDeque<QualityCheckResult>,
    capacity: usize,
}

impl QualityHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = QualityCheckResult>) {
        for result in results {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(result);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Failed checks among the newest `n` entries.
    pub fn recent_failures(&self, n: usize) -> usize {
        self.entries
            .iter()
            .rev()
            .take(n)
            .filter(|entry| !entry.passed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::transform::tests::record;
    use crate::reading::ChannelMap;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    fn complete(id: i64, temperature: f64) -> MeasurementRecord {
        record(
            id,
            now() - Duration::minutes(10),
            ChannelMap::default()
                .with(Channel::Temperature, temperature)
                .with(Channel::Humidity, 40.0)
                .with(Channel::Pressure, 1.0)
                .with(Channel::Vibration, 0.5),
        )
    }

    fn window(len: i64) -> Vec<MeasurementRecord> {
        (0..len).map(|id| complete(id, 40.0)).collect()
    }

    fn result<'a>(report: &'a QualityReport, name: &str) -> &'a QualityCheckResult {
        report
            .checks
            .iter()
            .find(|check| check.check_name == name)
            .expect("check present")
    }

    #[test]
    fn clean_window_is_accepted() {
        let report = QualityGate::default().evaluate(&window(10), now());
        assert_eq!(report.verdict, WindowVerdict::Accepted);
        assert!(report.checks.iter().all(|check| check.passed));
        assert!(report.checks.iter().any(|check| check.check_name == "range:temperature"));
    }

    #[test]
    fn out_of_range_over_threshold_rejects() {
        let mut records = window(10);
        for record in records.iter_mut().take(3) {
            record.channels.set(Channel::Temperature, Some(250.0));
        }
        let report = QualityGate::default().evaluate(&records, now());
        assert_eq!(result(&report, "range:temperature").affected_records, 3);
        assert_eq!(report.verdict, WindowVerdict::Rejected);
        assert_eq!(report.failed_names(), "range:temperature");
    }

    #[test]
    fn exactly_at_threshold_is_not_rejected() {
        let mut records = window(10);
        for record in records.iter_mut().take(2) {
            record.channels.set(Channel::Temperature, Some(-60.0));
        }
        let report = QualityGate::default().evaluate(&records, now());
        assert_eq!(report.verdict, WindowVerdict::Degraded);
    }

    #[test]
    fn moderate_nulls_fail_check_without_rejecting() {
        let mut records = window(20);
        for record in records.iter_mut().take(3) {
            record.channels.set(Channel::Humidity, None);
        }
        let report = QualityGate::default().evaluate(&records, now());
        let nulls = result(&report, CHECK_NULL_RATIO);
        assert!(!nulls.passed);
        assert_eq!(nulls.affected_records, 3);
        assert_eq!(report.verdict, WindowVerdict::Degraded);
    }

    #[test]
    fn duplicates_and_future_rows_are_counted() {
        let mut records = window(10);
        records.push(complete(4, 40.0));
        records[0].captured_at = now() + Duration::hours(2);
        let report = QualityGate::default().evaluate(&records, now());
        assert_eq!(result(&report, CHECK_DUPLICATES).affected_records, 1);
        assert_eq!(result(&report, CHECK_FUTURE_TIMESTAMPS).affected_records, 1);
        assert_eq!(report.verdict, WindowVerdict::Degraded);
    }

    #[test]
    fn history_keeps_newest_entries() {
        let report = QualityGate::default().evaluate(&window(5), now());
        let mut history = QualityHistory::new(4);
        history.extend(report.checks.clone());
        let mut failing = report.checks[0].clone();
        failing.passed = false;
        history.extend([failing]);
        assert_eq!(history.len(), 4);
        assert_eq!(history.recent_failures(20), 1);
        assert_eq!(history.recent_failures(0), 0);
    }
}
