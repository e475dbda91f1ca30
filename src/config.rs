use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/telemetry-etl/config.json";

const YEAR_SECS: u64 = 365 * 24 * 3600;
const MAX_EXTRACT_WINDOW_HOURS: u64 = 8760;
const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{key} is out of range: {reason}")]
    OutOfRange {
        key: &'static str,
        reason: &'static str,
    },
}

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("ETL_SETUP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Ok(state_dir) = env::var("ETL_STATE_DIR") {
        let trimmed = state_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join("config.json");
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    buffer_size: Option<usize>,
    #[serde(default)]
    batch_insert_size: Option<usize>,
    #[serde(default)]
    processing_interval_seconds: Option<u64>,
    #[serde(default)]
    quality_reject_threshold: Option<f64>,
    #[serde(default)]
    retention_days: Option<u32>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    report_dir: Option<String>,
    #[serde(default)]
    export_dir: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-etl failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-etl failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_is_set(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .is_some()
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(None),
    }
}

fn pick<T>(env_value: Option<T>, override_value: Option<T>, default: T) -> T {
    env_value.or(override_value).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            _ => Err(()),
        }
    }
}

/// Knobs for the ingest buffer, the batch writer and the ETL cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub buffer_size: usize,
    pub batch_insert_size: usize,
    pub writer_interval_seconds: u64,
    pub processing_interval_seconds: u64,
    pub extract_window_hours: i64,
    pub quality_reject_threshold: f64,
    pub null_ratio_threshold: f64,
    pub retention_days: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub transaction_timeout_ms: u64,
    pub stop_timeout_seconds: u64,
    pub degraded_after_aborts: u32,
    pub quality_history_len: usize,
    pub health_report_interval_seconds: u64,
    pub retention_interval_hours: u64,
    pub maintenance_poll_seconds: u64,
    pub report_dir: Option<PathBuf>,
    /// When set, each completed cycle also writes its window and views here.
    pub export_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_insert_size: 50,
            writer_interval_seconds: 5,
            processing_interval_seconds: 60,
            extract_window_hours: 1,
            quality_reject_threshold: 0.2,
            null_ratio_threshold: 0.1,
            retention_days: 90,
            max_retries: 3,
            retry_delay_ms: 500,
            transaction_timeout_ms: 10_000,
            stop_timeout_seconds: 30,
            degraded_after_aborts: 3,
            quality_history_len: 200,
            health_report_interval_seconds: 3600,
            retention_interval_hours: 24,
            maintenance_poll_seconds: 60,
            report_dir: None,
            export_dir: None,
        }
    }
}

impl PipelineConfig {
    fn from_env_with(overrides: &SetupConfigOverrides) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let buffer_size = pick(
            env_parse("ETL_BUFFER_SIZE")?,
            overrides.buffer_size,
            defaults.buffer_size,
        );
        let batch_insert_size = pick(
            env_parse("ETL_BATCH_INSERT_SIZE")?,
            overrides.batch_insert_size,
            defaults.batch_insert_size,
        );
        let processing_interval_seconds = pick(
            env_parse("ETL_PROCESSING_INTERVAL_SECONDS")?,
            overrides.processing_interval_seconds,
            defaults.processing_interval_seconds,
        );
        let quality_reject_threshold = pick(
            env_parse("ETL_QUALITY_REJECT_THRESHOLD")?,
            overrides.quality_reject_threshold,
            defaults.quality_reject_threshold,
        );
        let retention_days = pick(
            env_parse("ETL_RETENTION_DAYS")?,
            overrides.retention_days,
            defaults.retention_days,
        );
        let max_retries = pick(
            env_parse("ETL_MAX_RETRIES")?,
            overrides.max_retries,
            defaults.max_retries,
        );
        let report_dir = env_string("ETL_REPORT_DIR")
            .or_else(|| {
                overrides
                    .report_dir
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
            .map(PathBuf::from);
        let export_dir = env_string("ETL_EXPORT_DIR")
            .or_else(|| {
                overrides
                    .export_dir
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
            .map(PathBuf::from);

        let config = Self {
            buffer_size,
            batch_insert_size,
            writer_interval_seconds: env_parse("ETL_WRITER_INTERVAL_SECONDS")?
                .unwrap_or(defaults.writer_interval_seconds),
            processing_interval_seconds,
            extract_window_hours: env_parse("ETL_EXTRACT_WINDOW_HOURS")?
                .unwrap_or(defaults.extract_window_hours),
            quality_reject_threshold,
            null_ratio_threshold: env_parse("ETL_NULL_RATIO_THRESHOLD")?
                .unwrap_or(defaults.null_ratio_threshold),
            retention_days,
            max_retries,
            retry_delay_ms: env_parse("ETL_RETRY_DELAY_MS")?.unwrap_or(defaults.retry_delay_ms),
            transaction_timeout_ms: env_parse("ETL_TRANSACTION_TIMEOUT_MS")?
                .unwrap_or(defaults.transaction_timeout_ms),
            stop_timeout_seconds: env_parse("ETL_STOP_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.stop_timeout_seconds),
            degraded_after_aborts: env_parse("ETL_DEGRADED_AFTER_ABORTS")?
                .unwrap_or(defaults.degraded_after_aborts),
            quality_history_len: env_parse("ETL_QUALITY_HISTORY_LEN")?
                .unwrap_or(defaults.quality_history_len),
            health_report_interval_seconds: env_parse("ETL_HEALTH_REPORT_INTERVAL_SECONDS")?
                .unwrap_or(defaults.health_report_interval_seconds),
            retention_interval_hours: env_parse("ETL_RETENTION_INTERVAL_HOURS")?
                .unwrap_or(defaults.retention_interval_hours),
            maintenance_poll_seconds: env_parse("ETL_MAINTENANCE_POLL_SECONDS")?
                .unwrap_or(defaults.maintenance_poll_seconds),
            report_dir,
            export_dir,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |key: &'static str, value: u64| {
            if value == 0 {
                Err(ConfigError::OutOfRange {
                    key,
                    reason: "must be greater than zero",
                })
            } else {
                Ok(())
            }
        };
        // Time knobs feed chrono and tokio instant arithmetic, which panics on overflow.
        let bounded = |key: &'static str, value: u64, max: u64, reason: &'static str| {
            positive(key, value)?;
            if value > max {
                return Err(ConfigError::OutOfRange { key, reason });
            }
            Ok(())
        };
        let fraction = |key: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange {
                    key,
                    reason: "must be within (0, 1]",
                })
            }
        };

        positive("buffer_size", self.buffer_size as u64)?;
        positive("batch_insert_size", self.batch_insert_size as u64)?;
        bounded(
            "writer_interval_seconds",
            self.writer_interval_seconds,
            YEAR_SECS,
            "must be at most one year",
        )?;
        bounded(
            "processing_interval_seconds",
            self.processing_interval_seconds,
            YEAR_SECS,
            "must be at most one year",
        )?;
        bounded(
            "extract_window_hours",
            self.extract_window_hours.max(0) as u64,
            MAX_EXTRACT_WINDOW_HOURS,
            "must be at most 8760 hours",
        )?;
        bounded(
            "retention_days",
            self.retention_days as u64,
            MAX_RETENTION_DAYS,
            "must be at most 36500 days",
        )?;
        bounded(
            "transaction_timeout_ms",
            self.transaction_timeout_ms,
            YEAR_SECS * 1000,
            "must be at most one year",
        )?;
        bounded(
            "stop_timeout_seconds",
            self.stop_timeout_seconds,
            YEAR_SECS,
            "must be at most one year",
        )?;
        positive("degraded_after_aborts", self.degraded_after_aborts as u64)?;
        positive("quality_history_len", self.quality_history_len as u64)?;
        bounded(
            "health_report_interval_seconds",
            self.health_report_interval_seconds,
            YEAR_SECS,
            "must be at most one year",
        )?;
        bounded(
            "retention_interval_hours",
            self.retention_interval_hours,
            YEAR_SECS / 3600,
            "must be at most 8760 hours",
        )?;
        bounded(
            "maintenance_poll_seconds",
            self.maintenance_poll_seconds,
            YEAR_SECS,
            "must be at most one year",
        )?;
        if self.retry_delay_ms > YEAR_SECS * 1000 {
            return Err(ConfigError::OutOfRange {
                key: "retry_delay_ms",
                reason: "must be at most one year",
            });
        }
        fraction("quality_reject_threshold", self.quality_reject_threshold)?;
        fraction("null_ratio_threshold", self.null_ratio_threshold)?;
        if self.max_retries > 10 {
            return Err(ConfigError::OutOfRange {
                key: "max_retries",
                reason: "must be at most 10",
            });
        }
        Ok(())
    }

    pub fn writer_interval(&self) -> Duration {
        Duration::from_secs(self.writer_interval_seconds)
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_secs(self.processing_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    pub fn maintenance_poll_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_poll_seconds)
    }

    pub fn extract_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.extract_window_hours)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub enable_mqtt_listener: bool,
    pub grpc_socket_path: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let overrides = load_setup_config_overrides().unwrap_or_default();

        let store_backend = match env_string("ETL_STORE_BACKEND") {
            Some(raw) => raw.parse::<StoreBackend>().map_err(|_| ConfigError::Invalid {
                key: "ETL_STORE_BACKEND",
                value: raw,
            })?,
            None => StoreBackend::Postgres,
        };

        let database_url = env_string("ETL_DATABASE_URL")
            .or_else(|| env_string("DATABASE_URL"))
            .or_else(|| {
                overrides
                    .database_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .map(normalize_database_url);
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing(
                "ETL_DATABASE_URL or DATABASE_URL (or database_url in the setup config)",
            ))
            .context("telemetry-etl needs a database for the postgres store backend");
        }

        let mqtt_host = env_string("ETL_MQTT_HOST")
            .or_else(|| overrides.mqtt_host.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = if env_is_set("ETL_MQTT_PORT") {
            env_parse::<u16>("ETL_MQTT_PORT")?.unwrap_or(1883)
        } else {
            overrides.mqtt_port.filter(|v| *v != 0).unwrap_or(1883)
        };
        let mqtt_username = env_string("ETL_MQTT_USERNAME").or_else(|| {
            overrides
                .mqtt_username
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        });
        let mqtt_password = env_string("ETL_MQTT_PASSWORD").or_else(|| {
            overrides
                .mqtt_password
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        });
        let mqtt_topic_prefix = env_string("ETL_MQTT_TOPIC_PREFIX")
            .or_else(|| overrides.mqtt_topic_prefix.clone())
            .unwrap_or_else(|| "hermes".to_string());
        let mqtt_keepalive_secs = env_parse("ETL_MQTT_KEEPALIVE_SECS")?.unwrap_or(60);
        let mqtt_client_id = env_string("ETL_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("telemetry-etl-{}", std::process::id()));
        let enable_mqtt_listener = env_flag("ETL_ENABLE_MQTT", true);

        let grpc_socket_path = match env::var("ETL_GRPC_SOCKET") {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value.trim().to_string()),
            Err(_) => Some("/tmp/telemetry_etl.sock".to_string()),
        };
        let db_pool_size = env_parse("ETL_DB_POOL_SIZE")?.unwrap_or(10);
        let otlp_endpoint = env_string("OTEL_EXPORTER_OTLP_ENDPOINT");

        let pipeline = PipelineConfig::from_env_with(&overrides)?;

        Ok(Self {
            store_backend,
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            enable_mqtt_listener,
            grpc_socket_path,
            otlp_endpoint,
            pipeline,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_buffer_and_out_of_range_threshold() {
        let config = PipelineConfig {
            buffer_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                key: "buffer_size",
                ..
            })
        ));

        let config = PipelineConfig {
            quality_reject_threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                key: "quality_reject_threshold",
                ..
            })
        ));
    }

    fn rejected_key(config: PipelineConfig) -> Option<&'static str> {
        match config.validate() {
            Err(ConfigError::OutOfRange { key, .. }) => Some(key),
            _ => None,
        }
    }

    #[test]
    fn time_knobs_have_upper_bounds() {
        let cases = [
            (
                PipelineConfig {
                    retention_days: u32::MAX,
                    ..PipelineConfig::default()
                },
                "retention_days",
            ),
            (
                PipelineConfig {
                    extract_window_hours: 10_000_000_000,
                    ..PipelineConfig::default()
                },
                "extract_window_hours",
            ),
            (
                PipelineConfig {
                    health_report_interval_seconds: 9_000_000_000_000,
                    ..PipelineConfig::default()
                },
                "health_report_interval_seconds",
            ),
            (
                PipelineConfig {
                    retention_interval_hours: u64::MAX,
                    ..PipelineConfig::default()
                },
                "retention_interval_hours",
            ),
            (
                PipelineConfig {
                    processing_interval_seconds: u64::MAX,
                    ..PipelineConfig::default()
                },
                "processing_interval_seconds",
            ),
            (
                PipelineConfig {
                    writer_interval_seconds: YEAR_SECS + 1,
                    ..PipelineConfig::default()
                },
                "writer_interval_seconds",
            ),
            (
                PipelineConfig {
                    retry_delay_ms: u64::MAX,
                    ..PipelineConfig::default()
                },
                "retry_delay_ms",
            ),
        ];
        for (config, key) in cases {
            assert_eq!(rejected_key(config), Some(key));
        }
    }

    #[test]
    fn upper_bounds_are_inclusive() {
        let config = PipelineConfig {
            extract_window_hours: 8760,
            retention_days: 36_500,
            processing_interval_seconds: YEAR_SECS,
            health_report_interval_seconds: YEAR_SECS,
            retention_interval_hours: 8760,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
        let window_start = chrono::Utc::now() - config.extract_window();
        assert!(window_start < chrono::Utc::now());
        let cutoff = chrono::Utc::now() - chrono::Duration::days(config.retention_days as i64);
        assert!(cutoff < window_start);
    }

    #[test]
    fn setup_overrides_fill_unpinned_options() {
        let overrides = SetupConfigOverrides {
            buffer_size: Some(32),
            max_retries: Some(1),
            ..SetupConfigOverrides::default()
        };
        let config = PipelineConfig::from_env_with(&overrides).expect("valid overrides");
        assert_eq!(config.buffer_size, 32);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.batch_insert_size, 50);
    }

    #[test]
    fn normalizes_sqlalchemy_style_urls() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg://u@h/db".to_string()),
            "postgresql://u@h/db"
        );
        assert_eq!(
            normalize_database_url("postgres://u@h/db".to_string()),
            "postgres://u@h/db"
        );
    }
}
