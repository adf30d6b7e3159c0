//! Inbound payload decoding: raw MQTT bytes in, validated `Reading` (or
//! `DeviceStatus`) out.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamps below this are treated as seconds since epoch and upconverted.
/// Any plausible second-epoch date is far below it, any plausible
/// millisecond-epoch date far above it.
pub const SECONDS_EPOCH_CEILING: f64 = 1_000_000_000_000.0;

// ---------------------------------------------------------------------------
// Canonical records
// ---------------------------------------------------------------------------

/// Where a reading's timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    Device,
    /// Payload had no usable timestamp; stamped with local receipt time.
    Local,
}

/// One telemetry sample. `None` means the device did not report the channel
/// this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub timestamp_source: TimestampSource,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub vpd: Option<f64>,
    pub ph: Option<f64>,
    pub water_level: Option<f64>,
    pub reservoir_volume: Option<f64>,
    pub light_intensity: Option<f64>,
    pub vpd_pump_running: Option<bool>,
    pub ph_adjusting: Option<bool>,
}

/// Latest controller-side settings, published on the status channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    #[serde(default)]
    pub auto_mode: Option<bool>,
    #[serde(default)]
    pub pump_running: Option<bool>,
    #[serde(default)]
    pub ph_adjustment: Option<bool>,
    #[serde(default)]
    pub light_threshold: Option<f64>,
    #[serde(default, rename = "pHTarget", alias = "phTarget")]
    pub ph_target: Option<f64>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingMsg {
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    vpd: Option<f64>,
    #[serde(default, alias = "pH")]
    ph: Option<f64>,
    #[serde(default)]
    water_level: Option<f64>,
    #[serde(default)]
    reservoir_volume: Option<f64>,
    #[serde(default)]
    light_intensity: Option<f64>,
    #[serde(default)]
    vpd_pump_running: Option<bool>,
    #[serde(default)]
    ph_adjusting: Option<bool>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Normalize a device timestamp to milliseconds since epoch.
///
/// Values below 10^12 are seconds and get multiplied by 1000; everything else
/// is already milliseconds. Fractional input is rounded to the nearest ms.
pub fn normalize_timestamp(raw: f64) -> i64 {
    if raw < SECONDS_EPOCH_CEILING {
        (raw * 1000.0).round() as i64
    } else {
        raw.round() as i64
    }
}

/// A timestamp is usable only if it is a finite, positive JSON number.
fn device_timestamp(value: Option<&serde_json::Value>) -> Option<i64> {
    let raw = value?.as_f64()?;
    if raw.is_finite() && raw > 0.0 {
        Some(normalize_timestamp(raw))
    } else {
        None
    }
}

/// Parse a payload that must be a JSON object. Serde would otherwise map
/// array elements onto struct fields by position.
fn parse_object<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(DecodeError::Empty);
    }
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

/// Decode one telemetry payload. `received_ms` stamps readings that carry no
/// usable timestamp of their own.
pub fn decode_reading(payload: &[u8], received_ms: i64) -> Result<Reading, DecodeError> {
    let msg: ReadingMsg = parse_object(payload)?;

    let (timestamp, timestamp_source) = match device_timestamp(msg.timestamp.as_ref()) {
        Some(ts) => (ts, TimestampSource::Device),
        None => (received_ms, TimestampSource::Local),
    };

    Ok(Reading {
        timestamp,
        timestamp_source,
        temperature: msg.temperature,
        humidity: msg.humidity,
        vpd: msg.vpd,
        ph: msg.ph,
        water_level: msg.water_level,
        reservoir_volume: msg.reservoir_volume,
        light_intensity: msg.light_intensity,
        vpd_pump_running: msg.vpd_pump_running,
        ph_adjusting: msg.ph_adjusting,
    })
}

/// Decode one status-channel payload.
pub fn decode_status(payload: &[u8]) -> Result<DeviceStatus, DecodeError> {
    parse_object(payload)
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ===========================================================================
// Tests
// ===========================================================================
