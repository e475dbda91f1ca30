use super::stats;
use crate::reading::Channel;
use crate::store::{DerivedFields, MeasurementRecord};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCategory {
    Normal,
    Warning,
    Critical,
}

impl StatusCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCategory::Normal => "NORMAL",
            StatusCategory::Warning => "WARNING",
            StatusCategory::Critical => "CRITICAL",
        }
    }
}

/// Bins a channel into three categories. Boundaries are inclusive on the
/// lower category: a value equal to `warning_above` is still normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusRule {
    pub channel: Channel,
    pub warning_above: f64,
    pub critical_above: f64,
}

impl StatusRule {
    pub fn categorize(&self, value: f64) -> StatusCategory {
        if value <= self.warning_above {
            StatusCategory::Normal
        } else if value <= self.critical_above {
            StatusCategory::Warning
        } else {
            StatusCategory::Critical
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub clip_channels: Vec<Channel>,
    pub iqr_multiplier: f64,
    pub status_rules: Vec<StatusRule>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            clip_channels: vec![Channel::Temperature, Channel::Pressure, Channel::Vibration],
            iqr_multiplier: 3.0,
            status_rules: vec![StatusRule {
                channel: Channel::Temperature,
                warning_above: 85.0,
                critical_above: 95.0,
            }],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutcome {
    pub records: Vec<MeasurementRecord>,
    pub imputed: usize,
    pub clipped: usize,
}

/// Imputes gaps, clips outliers, derives magnitudes and status categories,
/// then orders by capture time. Pure: running it again on its own output
/// with `derived` stripped yields the same derived values.
pub fn transform_window(
    window: &[MeasurementRecord],
    config: &TransformConfig,
) -> TransformOutcome {
    let mut records: Vec<MeasurementRecord> = window.to_vec();
    let imputed = impute_missing(&mut records);
    let clipped = clip_outliers(&mut records, &config.clip_channels, config.iqr_multiplier);

    for record in &mut records {
        let mut statuses = BTreeMap::new();
        for rule in &config.status_rules {
            if let Some(value) = record.channels.get(rule.channel) {
                statuses.insert(rule.channel, rule.categorize(value));
            }
        }
        record.derived = Some(DerivedFields {
            vibration_magnitude: record.channels.magnitude(Channel::VIBRATION_AXES),
            gyro_magnitude: record.channels.magnitude(Channel::GYRO_AXES),
            statuses,
        });
    }

    records.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then(a.id.cmp(&b.id)));

    TransformOutcome {
        records,
        imputed,
        clipped,
    }
}

fn column(records: &[MeasurementRecord], channel: Channel) -> Vec<f64> {
    records
        .iter()
        .filter_map(|record| record.channels.get(channel))
        .collect()
}

/// Only channels observed somewhere in the window are filled; a channel no
/// device reported stays absent.
fn impute_missing(records: &mut [MeasurementRecord]) -> usize {
    let mut imputed = 0;
    for channel in Channel::ALL {
        let present = column(records, channel);
        if present.is_empty() || present.len() == records.len() {
            continue;
        }
        let fill = if channel.is_physical() {
            stats::median(&present).unwrap_or(0.0)
        } else {
            0.0
        };
        for record in records.iter_mut() {
            if record.channels.get(channel).is_none() {
                record.channels.set(channel, Some(fill));
                imputed += 1;
            }
        }
    }
    imputed
}

fn clip_outliers(records: &mut [MeasurementRecord], channels: &[Channel], k: f64) -> usize {
    let mut clipped = 0;
    for channel in channels {
        let Some((lower, upper)) = stats::iqr_bounds(&column(records, *channel), k) else {
            continue;
        };
        for record in records.iter_mut() {
            if let Some(value) = record.channels.get(*channel) {
                let bounded = value.clamp(lower, upper);
                if bounded != value {
                    record.channels.set(*channel, Some(bounded));
                    clipped += 1;
                }
            }
        }
    }
    clipped
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reading::ChannelMap;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    pub(crate) fn record(id: i64, at: DateTime<Utc>, channels: ChannelMap) -> MeasurementRecord {
        MeasurementRecord {
            id,
            equipment_key: "PUMP01_EQ".to_string(),
            sensor_key: "SENS_PUMP_01".to_string(),
            device_id: "ESP32_PUMP_01".to_string(),
            location: "Factory_A".to_string(),
            equipment_type: "Pump".to_string(),
            captured_at: at,
            channels,
            fault_detected: false,
            source: "test".to_string(),
            derived: None,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time")
    }

    #[test]
    fn temperature_bins_are_inclusive_on_lower_category() {
        let rule = TransformConfig::default().status_rules[0];
        assert_eq!(rule.categorize(85.0), StatusCategory::Normal);
        assert_eq!(rule.categorize(85.01), StatusCategory::Warning);
        assert_eq!(rule.categorize(95.0), StatusCategory::Warning);
        assert_eq!(rule.categorize(96.0), StatusCategory::Critical);
    }

    #[test]
    fn gaps_are_filled_with_median_or_zero() {
        let window = vec![
            record(
                1,
                base(),
                ChannelMap::default()
                    .with(Channel::Temperature, 40.0)
                    .with(Channel::GyroX, 1.0),
            ),
            record(2, base(), ChannelMap::default().with(Channel::Temperature, 50.0)),
            record(3, base(), ChannelMap::default().with(Channel::Temperature, 60.0)),
            record(4, base(), ChannelMap::default().with(Channel::Humidity, 30.0)),
        ];
        let outcome = transform_window(&window, &TransformConfig::default());
        let filled = outcome
            .records
            .iter()
            .find(|r| r.id == 4)
            .expect("record 4");
        assert_eq!(filled.channels.get(Channel::Temperature), Some(50.0));
        assert_eq!(filled.channels.get(Channel::GyroX), Some(0.0));
        // pressure never reported
        assert_eq!(filled.channels.get(Channel::Pressure), None);
        assert_eq!(outcome.imputed, 1 + 3 + 3);
    }

    #[test]
    fn extreme_values_are_clipped_to_iqr_fence() {
        let temperature = |id: i64, value: f64| {
            record(id, base(), ChannelMap::default().with(Channel::Temperature, value))
        };
        // 41..=47 plus one spike either side: Q1 = 42, Q3 = 46, fences at 30 and 58.
        let mut window: Vec<MeasurementRecord> =
            (41..=47).map(|value| temperature(value, value as f64)).collect();
        window.push(temperature(99, 1000.0));
        window.push(temperature(98, -500.0));

        let outcome = transform_window(&window, &TransformConfig::default());
        assert_eq!(outcome.records.len(), window.len());
        assert_eq!(outcome.clipped, 2);

        let value_of = |id: i64| {
            let record = outcome.records.iter().find(|r| r.id == id).expect("record");
            record.channels.get(Channel::Temperature).expect("temperature")
        };
        assert!((value_of(99) - 58.0).abs() < 1e-9, "{}", value_of(99));
        assert!((value_of(98) - 30.0).abs() < 1e-9, "{}", value_of(98));
        for id in 41..=47 {
            assert_eq!(value_of(id), id as f64);
        }

        let spike = outcome.records.iter().find(|r| r.id == 99).expect("spike");
        assert_eq!(
            spike.derived.as_ref().and_then(|d| d.statuses.get(&Channel::Temperature)),
            Some(&StatusCategory::Normal)
        );
    }

    #[test]
    fn derives_magnitudes_and_sorts_by_time() {
        let window = vec![
            record(
                2,
                base() + Duration::minutes(5),
                ChannelMap::default()
                    .with(Channel::VibrationX, 3.0)
                    .with(Channel::VibrationY, 4.0)
                    .with(Channel::VibrationZ, 0.0),
            ),
            record(1, base(), ChannelMap::default().with(Channel::Temperature, 90.0)),
        ];
        let outcome = transform_window(&window, &TransformConfig::default());
        assert_eq!(outcome.records[0].id, 1);
        let derived = outcome.records[1].derived.as_ref().expect("derived");
        assert_eq!(derived.vibration_magnitude, Some(5.0));
        assert_eq!(derived.gyro_magnitude, None);
    }

    #[test]
    fn second_pass_reproduces_derived_fields() {
        let window = vec![
            record(
                1,
                base(),
                ChannelMap::default()
                    .with(Channel::Temperature, 88.0)
                    .with(Channel::Pressure, 1.0),
            ),
            record(
                2,
                base() + Duration::minutes(1),
                ChannelMap::default().with(Channel::Temperature, 97.0),
            ),
            record(
                3,
                base() + Duration::minutes(2),
                ChannelMap::default().with(Channel::Pressure, 1.2),
            ),
        ];
        let config = TransformConfig::default();
        let first = transform_window(&window, &config);
        let stripped: Vec<MeasurementRecord> =
            first.records.iter().cloned().map(MeasurementRecord::without_derived).collect();
        let second = transform_window(&stripped, &config);

        let derived = |records: &[MeasurementRecord]| -> Vec<Option<DerivedFields>> {
            records.iter().map(|r| r.derived.clone()).collect()
        };
        assert_eq!(derived(&first.records), derived(&second.records));
        assert_eq!(second.imputed, 0);
    }
}
