use super::{MeasurementRecord, MeasurementStore, NewMeasurement, StoreError};
use crate::etl::aggregate::AggregationSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct EquipmentRow {
    device_id: String,
    location: String,
    equipment_type: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    equipment: BTreeMap<String, EquipmentRow>,
    sensors: BTreeSet<String>,
    measurements: Vec<MeasurementRecord>,
    next_id: i64,
    aggregates: Option<Arc<AggregationSet>>,
    aggregate_writes: u64,
}

/// Process-local store for the `memory` backend and for tests.
///
/// `fail_next` and `set_unavailable` inject transient failures so retry and
/// degradation paths can be exercised without a database. `set_ack_delay`
/// holds back the reply of an insert that has already committed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    fail_next: AtomicU32,
    ack_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// The next `count` operations fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::Release);
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.ack_delay_ms.store(millis, Ordering::Release);
    }

    /// Inserts records verbatim, bypassing dimension upserts and id
    /// assignment.
    pub fn seed(&self, records: impl IntoIterator<Item = MeasurementRecord>) {
        let mut state = self.lock();
        for record in records {
            state.next_id = state.next_id.max(record.id);
            state.measurements.push(record);
        }
    }

    pub fn measurement_count(&self) -> usize {
        self.lock().measurements.len()
    }

    pub fn equipment_count(&self) -> usize {
        self.lock().equipment.len()
    }

    pub fn sensor_count(&self) -> usize {
        self.lock().sensors.len()
    }

    pub fn aggregates(&self) -> Option<Arc<AggregationSet>> {
        self.lock().aggregates.clone()
    }

    pub fn aggregate_writes(&self) -> u64 {
        self.lock().aggregate_writes
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn persist_reading(&self, measurement: &NewMeasurement<'_>) -> Result<i64, StoreError> {
        self.check_available()?;
        let reading = measurement.reading;
        let id = {
            let mut state = self.lock();
            let equipment = state
                .equipment
                .entry(measurement.keys.equipment_key.clone())
                .or_insert_with(|| EquipmentRow {
                    device_id: reading.device_id.clone(),
                    location: reading.location.clone(),
                    equipment_type: reading.equipment_type.clone(),
                })
                .clone();
            state.sensors.insert(measurement.keys.sensor_key.clone());

            state.next_id += 1;
            let id = state.next_id;
            state.measurements.push(MeasurementRecord {
                id,
                equipment_key: measurement.keys.equipment_key.clone(),
                sensor_key: measurement.keys.sensor_key.clone(),
                device_id: equipment.device_id,
                location: equipment.location,
                equipment_type: equipment.equipment_type,
                captured_at: reading.captured_at,
                channels: measurement.channels.clone(),
                fault_detected: reading.fault_detected,
                source: reading.source.clone(),
                derived: None,
            });
            id
        };

        let ack_delay = self.ack_delay_ms.load(Ordering::Acquire);
        if ack_delay > 0 {
            tokio::time::sleep(Duration::from_millis(ack_delay)).await;
        }
        Ok(id)
    }

    async fn extract_window(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .measurements
            .iter()
            .filter(|record| record.captured_at >= since)
            .cloned()
            .collect())
    }

    async fn replace_aggregates(&self, set: &AggregationSet) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        state.aggregates = Some(Arc::new(set.clone()));
        state.aggregate_writes += 1;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.lock();
        let before = state.measurements.len();
        state.measurements.retain(|record| record.captured_at >= cutoff);
        Ok((before - state.measurements.len()) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{Channel, ChannelMap, SensorReading};
    use chrono::Duration;

    fn reading(device: &str, location: &str) -> SensorReading {
        SensorReading {
            device_id: device.to_string(),
            location: location.to_string(),
            equipment_type: "Pump".to_string(),
            captured_at: Utc::now(),
            channels: ChannelMap::default().with(Channel::Temperature, 41.0),
            fault_detected: false,
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn dimension_rows_are_created_once() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let first = reading("ESP32_PUMP_01", "Factory_A");
        let second = reading("ESP32_PUMP_01", "Factory_B");
        store.persist_reading(&NewMeasurement::from_reading(&first)).await?;
        store.persist_reading(&NewMeasurement::from_reading(&second)).await?;

        assert_eq!(store.equipment_count(), 1);
        assert_eq!(store.sensor_count(), 1);
        let window = store.extract_window(Utc::now() - Duration::hours(1)).await?;
        assert_eq!(window.len(), 2);
        assert!(window.iter().all(|record| record.location == "Factory_A"));
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted_down() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(store.ping().await.expect_err("first").is_transient());
        assert!(store.ping().await.is_err());
        store.ping().await?;
        Ok(())
    }

    #[tokio::test]
    async fn purge_removes_only_older_rows() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut old = reading("ESP32_A", "Factory_A");
        old.captured_at = Utc::now() - Duration::days(120);
        store.persist_reading(&NewMeasurement::from_reading(&old)).await?;
        store
            .persist_reading(&NewMeasurement::from_reading(&reading("ESP32_A", "Factory_A")))
            .await?;

        let removed = store.purge_before(Utc::now() - Duration::days(90)).await?;
        assert_eq!(removed, 1);
        assert_eq!(store.measurement_count(), 1);
        Ok(())
    }
}
