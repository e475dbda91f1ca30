use crate::etl::aggregate::AggregationSet;
use crate::reading::Channel;
use crate::store::MeasurementRecord;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const SENSOR_DATA_FILE: &str = "sensor_data";
pub const PREDICTIONS_FILE: &str = "fault_predictions";

/// Flat row for the transformed window: one column per channel, derived
/// magnitudes and one `status_<channel>` column per labelled channel.
fn record_row(record: &MeasurementRecord) -> Value {
    let mut row = Map::new();
    row.insert("id".into(), record.id.into());
    row.insert("device_id".into(), record.device_id.clone().into());
    row.insert("equipment_key".into(), record.equipment_key.clone().into());
    row.insert("sensor_key".into(), record.sensor_key.clone().into());
    row.insert("location".into(), record.location.clone().into());
    row.insert("equipment_type".into(), record.equipment_type.clone().into());
    row.insert("captured_at".into(), record.captured_at.to_rfc3339().into());
    for channel in Channel::ALL {
        row.insert(channel.as_str().into(), record.channels.get(channel).into());
    }
    for (name, value) in &record.channels.unknown {
        row.entry(name.clone()).or_insert_with(|| (*value).into());
    }
    row.insert("fault_detected".into(), record.fault_detected.into());
    row.insert("source".into(), record.source.clone().into());
    if let Some(derived) = &record.derived {
        row.insert("vibration_magnitude".into(), derived.vibration_magnitude.into());
        row.insert("gyro_magnitude".into(), derived.gyro_magnitude.into());
        for (channel, status) in &derived.statuses {
            row.insert(format!("status_{}", channel.as_str()), status.as_str().into());
        }
    }
    Value::Object(row)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, rows: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(rows)?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("write {}", path.display()))
}

/// Writes the transformed window and each non-empty view of one cycle as
/// `<name>_<YYYYmmdd_HHMMSS>.json` files, stamped with the cycle time.
pub async fn export_cycle(
    dir: &Path,
    records: &[MeasurementRecord],
    set: &AggregationSet,
) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    let stamp = set.generated_at.format("%Y%m%d_%H%M%S").to_string();
    let path_for = |name: &str| dir.join(format!("{name}_{stamp}.json"));
    let mut written = Vec::new();

    if !records.is_empty() {
        let rows: Vec<Value> = records.iter().map(record_row).collect();
        let path = path_for(SENSOR_DATA_FILE);
        write_json(&path, &rows).await?;
        written.push(path);
    }
    if !set.device_summary.rows.is_empty() {
        let path = path_for(set.device_summary.name);
        write_json(&path, &set.device_summary.rows).await?;
        written.push(path);
    }
    if !set.hourly_trends.rows.is_empty() {
        let path = path_for(set.hourly_trends.name);
        write_json(&path, &set.hourly_trends.rows).await?;
        written.push(path);
    }
    if !set.location_category.rows.is_empty() {
        let path = path_for(set.location_category.name);
        write_json(&path, &set.location_category.rows).await?;
        written.push(path);
    }
    if !set.predictions.is_empty() {
        let path = path_for(PREDICTIONS_FILE);
        write_json(&path, &set.predictions).await?;
        written.push(path);
    }
    Ok(written)
}
