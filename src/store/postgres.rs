use super::{MeasurementRecord, MeasurementStore, NewMeasurement, StoreError};
use crate::etl::aggregate::AggregationSet;
use crate::reading::{Channel, ChannelMap};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS equipment (
        equipment_key text primary key,
        device_id text not null,
        equipment_type text not null,
        location text not null,
        status text not null default 'ACTIVE',
        created_at timestamptz not null default now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensors (
        sensor_key text primary key,
        equipment_key text not null references equipment (equipment_key),
        sensor_type text not null default 'MULTI',
        status text not null default 'ACTIVE',
        created_at timestamptz not null default now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS measurements (
        id bigserial primary key,
        equipment_key text not null references equipment (equipment_key),
        sensor_key text not null references sensors (sensor_key),
        captured_at timestamptz not null,
        temperature double precision null,
        temperature_dht double precision null,
        humidity double precision null,
        pressure double precision null,
        vibration double precision null,
        vibration_x double precision null,
        vibration_y double precision null,
        vibration_z double precision null,
        gyro_x double precision null,
        gyro_y double precision null,
        gyro_z double precision null,
        extra_channels jsonb not null default '{}'::jsonb,
        fault_detected boolean not null default false,
        source text not null,
        inserted_at timestamptz not null default now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS measurements_captured_at_idx ON measurements (captured_at)",
    r#"
    CREATE TABLE IF NOT EXISTS agg_device_summary (
        device_id text primary key,
        equipment_key text not null,
        location text not null,
        equipment_type text not null,
        record_count bigint not null,
        fault_count bigint not null,
        last_seen timestamptz not null,
        channel_stats jsonb not null,
        window_start timestamptz not null,
        generated_at timestamptz not null
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agg_hourly_trends (
        hour timestamptz primary key,
        record_count bigint not null,
        fault_count bigint not null,
        channel_means jsonb not null,
        window_start timestamptz not null,
        generated_at timestamptz not null
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agg_location_category_summary (
        location text not null,
        equipment_type text not null,
        record_count bigint not null,
        device_count bigint not null,
        fault_count bigint not null,
        mean_temperature double precision null,
        mean_vibration double precision null,
        window_start timestamptz not null,
        generated_at timestamptz not null,
        primary key (location, equipment_type)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fault_predictions (
        device_id text primary key,
        equipment_key text not null,
        captured_at timestamptz not null,
        fault_probability double precision not null,
        predicted_fault boolean not null,
        alert_level text not null,
        generated_at timestamptz not null
    )
    "#,
];

fn channel_columns(prefix: &str) -> String {
    Channel::ALL
        .iter()
        .map(|channel| format!("{prefix}{}", channel.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_measurement_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        // equipment_key, sensor_key, captured_at, channels..., extra, fault, source
        let placeholders = (1..=Channel::COUNT + 6)
            .map(|idx| format!("${idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO measurements (equipment_key, sensor_key, captured_at, {}, extra_channels, fault_detected, source) VALUES ({placeholders}) RETURNING id",
            channel_columns("")
        )
    })
}

fn select_window_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        format!(
            r#"
            SELECT m.id, m.equipment_key, m.sensor_key, e.device_id, e.location, e.equipment_type,
                   m.captured_at, {}, m.extra_channels, m.fault_detected, m.source
            FROM measurements m
            JOIN equipment e ON e.equipment_key = m.equipment_key
            WHERE m.captured_at >= $1
            ORDER BY m.captured_at, m.id
            "#,
            channel_columns("m.")
        )
    })
}

fn record_from_row(row: &PgRow) -> Result<MeasurementRecord, sqlx::Error> {
    let mut channels = ChannelMap::default();
    for channel in Channel::ALL {
        channels.set(channel, row.try_get::<Option<f64>, _>(channel.as_str())?);
    }
    channels.unknown = row
        .try_get::<Json<BTreeMap<String, f64>>, _>("extra_channels")?
        .0;
    Ok(MeasurementRecord {
        id: row.try_get("id")?,
        equipment_key: row.try_get("equipment_key")?,
        sensor_key: row.try_get("sensor_key")?,
        device_id: row.try_get("device_id")?,
        location: row.try_get("location")?,
        equipment_type: row.try_get("equipment_type")?,
        captured_at: row.try_get("captured_at")?,
        channels,
        fault_detected: row.try_get("fault_detected")?,
        source: row.try_get("source")?,
        derived: None,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeasurementStore for PgStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn persist_reading(&self, measurement: &NewMeasurement<'_>) -> Result<i64, StoreError> {
        let reading = measurement.reading;
        let keys = &measurement.keys;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO equipment (equipment_key, device_id, equipment_type, location) VALUES ($1, $2, $3, $4) ON CONFLICT (equipment_key) DO NOTHING",
        )
        .bind(&keys.equipment_key)
        .bind(&reading.device_id)
        .bind(&reading.equipment_type)
        .bind(&reading.location)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO sensors (sensor_key, equipment_key) VALUES ($1, $2) ON CONFLICT (sensor_key) DO NOTHING",
        )
        .bind(&keys.sensor_key)
        .bind(&keys.equipment_key)
        .execute(&mut *tx)
        .await?;

        let mut insert = sqlx::query_scalar::<_, i64>(insert_measurement_sql())
            .bind(&keys.equipment_key)
            .bind(&keys.sensor_key)
            .bind(reading.captured_at);
        for channel in Channel::ALL {
            insert = insert.bind(measurement.channels.get(channel));
        }
        let id = insert
            .bind(Json(&measurement.channels.unknown))
            .bind(reading.fault_detected)
            .bind(&reading.source)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn extract_window(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        let rows = sqlx::query(select_window_sql())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn replace_aggregates(&self, set: &AggregationSet) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM agg_device_summary").execute(&mut *tx).await?;
        if !set.device_summary.rows.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO agg_device_summary (device_id, equipment_key, location, equipment_type, record_count, fault_count, last_seen, channel_stats, window_start, generated_at) ",
            );
            builder.push_values(set.device_summary.rows.iter(), |mut b, row| {
                b.push_bind(&row.device_id)
                    .push_bind(&row.equipment_key)
                    .push_bind(&row.location)
                    .push_bind(&row.equipment_type)
                    .push_bind(row.record_count as i64)
                    .push_bind(row.fault_count as i64)
                    .push_bind(row.last_seen)
                    .push_bind(Json(&row.channels))
                    .push_bind(set.window_start)
                    .push_bind(set.generated_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM agg_hourly_trends").execute(&mut *tx).await?;
        if !set.hourly_trends.rows.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO agg_hourly_trends (hour, record_count, fault_count, channel_means, window_start, generated_at) ",
            );
            builder.push_values(set.hourly_trends.rows.iter(), |mut b, row| {
                b.push_bind(row.hour)
                    .push_bind(row.record_count as i64)
                    .push_bind(row.fault_count as i64)
                    .push_bind(Json(&row.means))
                    .push_bind(set.window_start)
                    .push_bind(set.generated_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM agg_location_category_summary")
            .execute(&mut *tx)
            .await?;
        if !set.location_category.rows.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO agg_location_category_summary (location, equipment_type, record_count, device_count, fault_count, mean_temperature, mean_vibration, window_start, generated_at) ",
            );
            builder.push_values(set.location_category.rows.iter(), |mut b, row| {
                b.push_bind(&row.location)
                    .push_bind(&row.equipment_type)
                    .push_bind(row.record_count as i64)
                    .push_bind(row.device_count as i64)
                    .push_bind(row.fault_count as i64)
                    .push_bind(row.mean_temperature)
                    .push_bind(row.mean_vibration)
                    .push_bind(set.window_start)
                    .push_bind(set.generated_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM fault_predictions").execute(&mut *tx).await?;
        if !set.predictions.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO fault_predictions (device_id, equipment_key, captured_at, fault_probability, predicted_fault, alert_level, generated_at) ",
            );
            builder.push_values(set.predictions.iter(), |mut b, prediction| {
                b.push_bind(&prediction.device_id)
                    .push_bind(&prediction.equipment_key)
                    .push_bind(prediction.captured_at)
                    .push_bind(prediction.fault_probability)
                    .push_bind(prediction.predicted_fault)
                    .push_bind(prediction.alert_level.as_str())
                    .push_bind(set.generated_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM measurements WHERE captured_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
