//! Alert levels for the current-reading cards. Always derived from a
//! snapshot at read time, never stored on readings.

use serde::{Deserialize, Serialize};

use crate::freshness::CurrentSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Unknown,
    Ok,
    Warning,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Unknown,
    Normal,
    VpdAdjusting,
    PhAdjusting,
}

/// Bands outside of which a metric is flagged.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub vpd_min: f64,
    pub vpd_max: f64,
    pub ph_min: f64,
    pub ph_max: f64,
    pub water_level_min: f64,
    pub reservoir_volume_min: f64,
    pub light_intensity_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            vpd_min: 0.8,
            vpd_max: 1.2,
            ph_min: 5.5,
            ph_max: 6.5,
            water_level_min: 10.0,
            reservoir_volume_min: 1000.0,
            light_intensity_min: 500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub vpd: Level,
    pub ph: Level,
    pub water_level: Level,
    pub reservoir_volume: Level,
    pub light_intensity: Level,
    pub activity: Activity,
}

fn band(value: Option<f64>, min: f64, max: f64) -> Level {
    match value {
        None => Level::Unknown,
        Some(v) if v < min || v > max => Level::Alert,
        Some(_) => Level::Ok,
    }
}

fn floor(value: Option<f64>, min: f64) -> Level {
    match value {
        None => Level::Unknown,
        Some(v) if v < min => Level::Warning,
        Some(_) => Level::Ok,
    }
}

/// Assess a snapshot. A stale snapshot has its measurements blanked already,
/// so everything comes out `Unknown`.
pub fn assess(snap: &CurrentSnapshot, t: &Thresholds) -> Assessment {
    let activity = match (snap.vpd_pump_running, snap.ph_adjusting) {
        (Some(true), _) => Activity::VpdAdjusting,
        (_, Some(true)) => Activity::PhAdjusting,
        (None, None) => Activity::Unknown,
        _ => Activity::Normal,
    };

    Assessment {
        vpd: band(snap.vpd, t.vpd_min, t.vpd_max),
        ph: band(snap.ph, t.ph_min, t.ph_max),
        water_level: floor(snap.water_level, t.water_level_min),
        reservoir_volume: floor(snap.reservoir_volume, t.reservoir_volume_min),
        light_intensity: floor(snap.light_intensity, t.light_intensity_min),
        activity,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
