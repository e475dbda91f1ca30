mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{build_pool, PgStore};

use crate::etl::aggregate::AggregationSet;
use crate::etl::transform::StatusCategory;
use crate::reading::{Channel, ChannelMap, SensorReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Stable string keys for the device's equipment and sensor dimension rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionKeys {
    pub equipment_key: String,
    pub sensor_key: String,
}

impl DimensionKeys {
    /// `ESP32_PUMP_01` maps to equipment `PUMP01_EQ` and sensor `SENS_PUMP_01`.
    pub fn for_device(device_id: &str) -> Self {
        let compact: String = device_id.replace("ESP32_", "").replace('_', "");
        Self {
            equipment_key: format!("{compact}_EQ"),
            sensor_key: device_id.replace("ESP32_", "SENS_"),
        }
    }
}

/// One reading prepared for persistence: dimension keys resolved and the
/// write-time vibration total filled in.
#[derive(Debug, Clone)]
pub struct NewMeasurement<'a> {
    pub reading: &'a SensorReading,
    pub keys: DimensionKeys,
    pub channels: ChannelMap,
}

impl<'a> NewMeasurement<'a> {
    pub fn from_reading(reading: &'a SensorReading) -> Self {
        let mut channels = reading.channels.clone();
        if channels.get(Channel::Vibration).is_none() {
            channels.set(Channel::Vibration, channels.magnitude(Channel::VIBRATION_AXES));
        }
        Self {
            reading,
            keys: DimensionKeys::for_device(&reading.device_id),
            channels,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFields {
    pub vibration_magnitude: Option<f64>,
    pub gyro_magnitude: Option<f64>,
    pub statuses: BTreeMap<Channel, StatusCategory>,
}

/// A persisted measurement joined with its dimension rows, as the ETL cycle
/// sees it. `derived` is only populated by the transform stage.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub id: i64,
    pub equipment_key: String,
    pub sensor_key: String,
    pub device_id: String,
    pub location: String,
    pub equipment_type: String,
    pub captured_at: DateTime<Utc>,
    pub channels: ChannelMap,
    pub fault_detected: bool,
    pub source: String,
    pub derived: Option<DerivedFields>,
}

impl MeasurementRecord {
    pub fn without_derived(mut self) -> Self {
        self.derived = None;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Connection-level failures are retried; anything the database refused
    /// on its merits is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // connection_exception
                Some(code) if code.starts_with("08") => StoreError::Unavailable(err.to_string()),
                Some("40001") // serialization_failure
                | Some("40P01") // deadlock_detected
                | Some("53300") // too_many_connections
                | Some("57P01") => StoreError::Unavailable(err.to_string()), // admin_shutdown
                _ => StoreError::Rejected(err.to_string()),
            },
            _ => StoreError::Rejected(err.to_string()),
        }
    }
}

/// Persistence seam for measurements and aggregate exports.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Upserts the equipment and sensor dimension rows and inserts the
    /// measurement in one transaction; returns the measurement id.
    async fn persist_reading(&self, measurement: &NewMeasurement<'_>) -> Result<i64, StoreError>;

    /// Measurements captured at or after `since`, joined with dimensions.
    /// There is no upper bound so future-dated rows reach the quality gate.
    async fn extract_window(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeasurementRecord>, StoreError>;

    /// Swaps every aggregate view atomically.
    async fn replace_aggregates(&self, set: &AggregationSet) -> Result<(), StoreError>;

    /// Deletes measurements captured before `cutoff`; returns rows removed.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
