use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_LOCATION: &str = "Unknown";
pub const DEFAULT_EQUIPMENT_TYPE: &str = "Unknown";
pub const DEFAULT_SOURCE: &str = "MQTT";

/// Known sensor channels. Anything else a device reports lands in
/// [`ChannelMap::unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Temperature,
    TemperatureDht,
    Humidity,
    Pressure,
    Vibration,
    VibrationX,
    VibrationY,
    VibrationZ,
    GyroX,
    GyroY,
    GyroZ,
}

impl Channel {
    pub const COUNT: usize = 11;

    pub const ALL: [Channel; Channel::COUNT] = [
        Channel::Temperature,
        Channel::TemperatureDht,
        Channel::Humidity,
        Channel::Pressure,
        Channel::Vibration,
        Channel::VibrationX,
        Channel::VibrationY,
        Channel::VibrationZ,
        Channel::GyroX,
        Channel::GyroY,
        Channel::GyroZ,
    ];

    pub const VIBRATION_AXES: [Channel; 3] =
        [Channel::VibrationX, Channel::VibrationY, Channel::VibrationZ];
    pub const GYRO_AXES: [Channel; 3] = [Channel::GyroX, Channel::GyroY, Channel::GyroZ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Temperature => "temperature",
            Channel::TemperatureDht => "temperature_dht",
            Channel::Humidity => "humidity",
            Channel::Pressure => "pressure",
            Channel::Vibration => "vibration",
            Channel::VibrationX => "vibration_x",
            Channel::VibrationY => "vibration_y",
            Channel::VibrationZ => "vibration_z",
            Channel::GyroX => "gyro_x",
            Channel::GyroY => "gyro_y",
            Channel::GyroZ => "gyro_z",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let channel = match key.trim().to_ascii_lowercase().as_str() {
            "temperature" => Channel::Temperature,
            "temperature_dht" => Channel::TemperatureDht,
            "humidity" => Channel::Humidity,
            "pressure" => Channel::Pressure,
            "vibration" => Channel::Vibration,
            "vibration_x" | "vibr_x" => Channel::VibrationX,
            "vibration_y" | "vibr_y" => Channel::VibrationY,
            "vibration_z" | "vibr_z" => Channel::VibrationZ,
            "gyro_x" => Channel::GyroX,
            "gyro_y" => Channel::GyroY,
            "gyro_z" => Channel::GyroZ,
            _ => return None,
        };
        Some(channel)
    }

    /// Physical measurements are imputed with the column median, counters
    /// and axis components with zero.
    pub fn is_physical(self) -> bool {
        matches!(
            self,
            Channel::Temperature | Channel::TemperatureDht | Channel::Humidity | Channel::Pressure
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelMap {
    values: [Option<f64>; Channel::COUNT],
    pub unknown: BTreeMap<String, f64>,
}

impl ChannelMap {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values[channel.index()]
    }

    pub fn set(&mut self, channel: Channel, value: Option<f64>) {
        self.values[channel.index()] = value.filter(|v| v.is_finite());
    }

    pub fn with(mut self, channel: Channel, value: f64) -> Self {
        self.set(channel, Some(value));
        self
    }

    pub fn known(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        Channel::ALL
            .iter()
            .filter_map(|channel| self.get(*channel).map(|value| (*channel, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none) && self.unknown.is_empty()
    }

    pub fn magnitude(&self, axes: [Channel; 3]) -> Option<f64> {
        let x = self.get(axes[0])?;
        let y = self.get(axes[1])?;
        let z = self.get(axes[2])?;
        Some((x * x + y * y + z * z).sqrt())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub device_id: String,
    pub location: String,
    pub equipment_type: String,
    pub captured_at: DateTime<Utc>,
    pub channels: ChannelMap,
    pub fault_detected: bool,
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed reading: {0}")]
    Malformed(&'static str),
    #[error("malformed reading: invalid json: {0}")]
    Json(#[from] simd_json::Error),
}

#[derive(Debug, Deserialize)]
struct WireReading {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    equipment_type: Option<String>,
    #[serde(default)]
    sensors: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    fault_detected: Option<bool>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Int(i64),
    Float(f64),
    Str(String),
}

impl WireTimestamp {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Int(ms) => millis_to_dt(*ms),
            WireTimestamp::Float(ms) if ms.is_finite() => millis_to_dt(*ms as i64),
            WireTimestamp::Float(_) => None,
            WireTimestamp::Str(raw) => parse_iso8601(raw),
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Naive ISO-8601 (no offset) is taken as UTC.
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Validates and normalizes one inbound payload into a [`SensorReading`].
///
/// The topic is only used for diagnostics; callers route by topic before
/// decoding. `default_source` tags readings whose payload has no `source`.
pub fn decode_reading(
    topic: &str,
    payload: &mut [u8],
    default_source: &str,
) -> Result<SensorReading, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Malformed("empty payload"));
    }
    let wire: WireReading = simd_json::serde::from_slice(payload)?;

    let device_id = non_blank(wire.device_id).ok_or(DecodeError::Malformed("missing device_id"))?;
    let captured_at = wire
        .timestamp
        .as_ref()
        .ok_or(DecodeError::Malformed("missing timestamp"))?
        .to_datetime()
        .ok_or(DecodeError::Malformed("unparseable timestamp"))?;

    let sensors = wire
        .sensors
        .ok_or(DecodeError::Malformed("missing sensors"))?;
    let mut channels = ChannelMap::default();
    for (key, value) in sensors {
        let Some(value) = value.as_f64().filter(|v| v.is_finite()) else {
            tracing::trace!(
                topic,
                device = %device_id,
                channel = %key,
                "ignoring non-numeric channel"
            );
            continue;
        };
        match Channel::from_key(&key) {
            Some(channel) => channels.set(channel, Some(value)),
            None => {
                channels.unknown.insert(key, value);
            }
        }
    }
    if channels.is_empty() {
        return Err(DecodeError::Malformed("empty sensors map"));
    }

    Ok(SensorReading {
        device_id,
        location: non_blank(wire.location).unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        equipment_type: non_blank(wire.equipment_type)
            .unwrap_or_else(|| DEFAULT_EQUIPMENT_TYPE.to_string()),
        captured_at,
        channels,
        fault_detected: wire.fault_detected.unwrap_or(false),
        source: non_blank(wire.source).unwrap_or_else(|| default_source.to_string()),
    })
}
