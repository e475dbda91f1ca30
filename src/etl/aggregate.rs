use super::stats;
use crate::reading::Channel;
use crate::scoring::FaultPrediction;
use crate::store::MeasurementRecord;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const VIEW_DEVICE_SUMMARY: &str = "device_summary";
pub const VIEW_HOURLY_TRENDS: &str = "hourly_trends";
pub const VIEW_LOCATION_CATEGORY: &str = "location_category_summary";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: Option<f64>,
}

impl ChannelStats {
    fn from_values(values: &[f64]) -> Option<Self> {
        let mean = stats::mean(values)?;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            count: values.len(),
            mean,
            min,
            max,
            std: stats::sample_std(values),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub equipment_key: String,
    pub location: String,
    pub equipment_type: String,
    pub record_count: usize,
    pub fault_count: usize,
    pub last_seen: DateTime<Utc>,
    pub channels: BTreeMap<String, ChannelStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyTrend {
    pub hour: DateTime<Utc>,
    pub record_count: usize,
    pub fault_count: usize,
    pub means: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationCategorySummary {
    pub location: String,
    pub equipment_type: String,
    pub record_count: usize,
    pub device_count: usize,
    pub fault_count: usize,
    pub mean_temperature: Option<f64>,
    pub mean_vibration: Option<f64>,
}

/// A named table keyed by its grouping dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationView<R> {
    pub name: &'static str,
    pub rows: Vec<R>,
}

impl<R> AggregationView<R> {
    fn new(name: &'static str, rows: Vec<R>) -> Self {
        Self { name, rows }
    }
}

/// Everything one cycle exports. Replaced as a whole; readers never see a
/// mix of two cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationSet {
    pub window_start: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub record_count: usize,
    pub device_summary: AggregationView<DeviceSummary>,
    pub hourly_trends: AggregationView<HourlyTrend>,
    pub location_category: AggregationView<LocationCategorySummary>,
    pub predictions: Vec<FaultPrediction>,
}

impl AggregationSet {
    pub fn view_sizes(&self) -> [(&'static str, usize); 3] {
        [
            (self.device_summary.name, self.device_summary.rows.len()),
            (self.hourly_trends.name, self.hourly_trends.rows.len()),
            (self.location_category.name, self.location_category.rows.len()),
        ]
    }
}

fn channel_values<'a>(
    records: impl Iterator<Item = &'a MeasurementRecord>,
    channel: Channel,
) -> Vec<f64> {
    records.filter_map(|record| record.channels.get(channel)).collect()
}

/// Vibration as stored, falling back to the derived axis magnitude.
fn vibration_of(record: &MeasurementRecord) -> Option<f64> {
    record.channels.get(Channel::Vibration).or_else(|| {
        record
            .derived
            .as_ref()
            .and_then(|derived| derived.vibration_magnitude)
    })
}

/// Builds the three views over a transformed window. Groups are ordered by
/// key so repeated runs over the same input produce identical output.
pub fn aggregate_window(
    records: &[MeasurementRecord],
    monitored: &[Channel],
    window_start: DateTime<Utc>,
    generated_at: DateTime<Utc>,
) -> AggregationSet {
    AggregationSet {
        window_start,
        generated_at,
        record_count: records.len(),
        device_summary: AggregationView::new(
            VIEW_DEVICE_SUMMARY,
            device_summary(records, monitored),
        ),
        hourly_trends: AggregationView::new(VIEW_HOURLY_TRENDS, hourly_trends(records, monitored)),
        location_category: AggregationView::new(VIEW_LOCATION_CATEGORY, location_category(records)),
        predictions: Vec::new(),
    }
}

fn device_summary(records: &[MeasurementRecord], monitored: &[Channel]) -> Vec<DeviceSummary> {
    let mut groups: BTreeMap<&str, Vec<&MeasurementRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.device_id.as_str()).or_default().push(record);
    }

    groups
        .into_iter()
        .filter_map(|(device_id, group)| {
            let latest = group.iter().max_by_key(|record| record.captured_at)?;
            let mut channels = BTreeMap::new();
            for channel in monitored {
                let values = channel_values(group.iter().copied(), *channel);
                if let Some(stats) = ChannelStats::from_values(&values) {
                    channels.insert(channel.as_str().to_string(), stats);
                }
            }
            Some(DeviceSummary {
                device_id: device_id.to_string(),
                equipment_key: latest.equipment_key.clone(),
                location: latest.location.clone(),
                equipment_type: latest.equipment_type.clone(),
                record_count: group.len(),
                fault_count: group.iter().filter(|record| record.fault_detected).count(),
                last_seen: latest.captured_at,
                channels,
            })
        })
        .collect()
}

fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at)
}

fn hourly_trends(records: &[MeasurementRecord], monitored: &[Channel]) -> Vec<HourlyTrend> {
    let mut groups: BTreeMap<DateTime<Utc>, Vec<&MeasurementRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(hour_bucket(record.captured_at)).or_default().push(record);
    }

    groups
        .into_iter()
        .map(|(hour, group)| {
            let means = monitored
                .iter()
                .filter_map(|channel| {
                    let values = channel_values(group.iter().copied(), *channel);
                    stats::mean(&values).map(|mean| (channel.as_str().to_string(), mean))
                })
                .collect();
            HourlyTrend {
                hour,
                record_count: group.len(),
                fault_count: group.iter().filter(|record| record.fault_detected).count(),
                means,
            }
        })
        .collect()
}

fn location_category(records: &[MeasurementRecord]) -> Vec<LocationCategorySummary> {
    let mut groups: BTreeMap<(&str, &str), Vec<&MeasurementRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.location.as_str(), record.equipment_type.as_str()))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|((location, equipment_type), group)| {
            let devices: BTreeSet<&str> =
                group.iter().map(|record| record.device_id.as_str()).collect();
            let vibration: Vec<f64> =
                group.iter().filter_map(|record| vibration_of(record)).collect();
            LocationCategorySummary {
                location: location.to_string(),
                equipment_type: equipment_type.to_string(),
                record_count: group.len(),
                device_count: devices.len(),
                fault_count: group.iter().filter(|record| record.fault_detected).count(),
                mean_temperature: stats::mean(&channel_values(
                    group.iter().copied(),
                    Channel::Temperature,
                )),
                mean_vibration: stats::mean(&vibration),
            }
        })
        .collect()
}
