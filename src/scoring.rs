use crate::reading::Channel;
use crate::store::MeasurementRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
}

impl AlertLevel {
    pub fn from_probability(probability: f64) -> Self {
        if probability > 0.7 {
            AlertLevel::High
        } else if probability > 0.4 {
            AlertLevel::Medium
        } else {
            AlertLevel::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Low => "LOW",
            AlertLevel::Medium => "MEDIUM",
            AlertLevel::High => "HIGH",
        }
    }
}

/// Scoring inputs; channels a record lacks are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureVector {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub vibration: f64,
    pub vibration_axes: [f64; 3],
    pub gyro_axes: [f64; 3],
}

impl FeatureVector {
    pub fn from_record(record: &MeasurementRecord) -> Self {
        let value = |channel: Channel| record.channels.get(channel).unwrap_or(0.0);
        let axes = |channels: [Channel; 3]| channels.map(value);
        let vibration = record
            .channels
            .get(Channel::Vibration)
            .or_else(|| record.derived.as_ref().and_then(|d| d.vibration_magnitude))
            .unwrap_or(0.0);
        Self {
            temperature: value(Channel::Temperature),
            pressure: value(Channel::Pressure),
            humidity: value(Channel::Humidity),
            vibration,
            vibration_axes: axes(Channel::VIBRATION_AXES),
            gyro_axes: axes(Channel::GYRO_AXES),
        }
    }
}

/// Maps features to a fault probability. Implementations need not clamp;
/// [`score_latest`] forces the result into `[0, 1]`.
pub trait FaultScorer: Send + Sync {
    fn score(&self, features: &FeatureVector) -> f64;
}

/// Linear risk from temperature above 70 and vibration above 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl FaultScorer for HeuristicScorer {
    fn score(&self, features: &FeatureVector) -> f64 {
        let temp_risk = (features.temperature - 70.0) / 30.0;
        let vib_risk = (features.vibration - 2.0) / 8.0;
        temp_risk + vib_risk
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultPrediction {
    pub device_id: String,
    pub equipment_key: String,
    pub captured_at: DateTime<Utc>,
    pub fault_probability: f64,
    pub predicted_fault: bool,
    pub alert_level: AlertLevel,
}

fn clamp_probability(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Scores the most recent record of each device in the window.
pub fn score_latest(
    records: &[MeasurementRecord],
    scorer: &dyn FaultScorer,
) -> Vec<FaultPrediction> {
    let mut latest: BTreeMap<&str, &MeasurementRecord> = BTreeMap::new();
    for record in records {
        let slot = latest.entry(record.device_id.as_str()).or_insert(record);
        if (record.captured_at, record.id) > (slot.captured_at, slot.id) {
            *slot = record;
        }
    }

    latest
        .into_values()
        .map(|record| {
            let probability = clamp_probability(scorer.score(&FeatureVector::from_record(record)));
            FaultPrediction {
                device_id: record.device_id.clone(),
                equipment_key: record.equipment_key.clone(),
                captured_at: record.captured_at,
                fault_probability: probability,
                predicted_fault: probability > 0.5,
                alert_level: AlertLevel::from_probability(probability),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::transform::tests::record;
    use crate::reading::ChannelMap;
    use chrono::{Duration, TimeZone};

    struct Fixed(f64);

    impl FaultScorer for Fixed {
        fn score(&self, _features: &FeatureVector) -> f64 {
            self.0
        }
    }

    fn at(minute: i64) -> DateTime<Utc> {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time");
        base + Duration::minutes(minute)
    }

    #[test]
    fn alert_levels_use_strict_bounds() {
        assert_eq!(AlertLevel::from_probability(0.4), AlertLevel::Low);
        assert_eq!(AlertLevel::from_probability(0.41), AlertLevel::Medium);
        assert_eq!(AlertLevel::from_probability(0.7), AlertLevel::Medium);
        assert_eq!(AlertLevel::from_probability(0.71), AlertLevel::High);
    }

    #[test]
    fn heuristic_rises_with_heat_and_vibration() {
        let cool = FeatureVector {
            temperature: 60.0,
            vibration: 1.0,
            ..FeatureVector::default()
        };
        let hot = FeatureVector {
            temperature: 100.0,
            vibration: 6.0,
            ..FeatureVector::default()
        };
        assert!(HeuristicScorer.score(&cool) < 0.0);
        assert!((HeuristicScorer.score(&hot) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn only_latest_record_per_device_is_scored_and_clamped() {
        let records = vec![
            record(1, at(0), ChannelMap::default().with(Channel::Temperature, 40.0)),
            record(
                2,
                at(5),
                ChannelMap::default()
                    .with(Channel::Temperature, 100.0)
                    .with(Channel::Vibration, 10.0),
            ),
        ];
        let predictions = score_latest(&records, &HeuristicScorer);
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].captured_at, at(5));
        assert_eq!(predictions[0].fault_probability, 1.0);
        assert_eq!(predictions[0].alert_level, AlertLevel::High);

        let nan = score_latest(&records, &Fixed(f64::NAN));
        assert_eq!(nan[0].fault_probability, 0.0);
        assert_eq!(nan[0].alert_level, AlertLevel::Low);
    }
}
