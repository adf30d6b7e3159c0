//! Data-feed freshness: Live while readings keep arriving, Stale once the
//! timeout elapses or the transport is known down.
//!
//! ```text
//! NoData ──[insert]──▶ Live ──[timeout | transport down]──▶ Stale
//!                       ▲                                     │
//!                       └───────────────[insert]──────────────┘
//! ```

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::reading::{Reading, TimestampSource};
use crate::state::SharedState;

/// Default time without a successful insert before data is stale.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default polling period of the monitor task.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FreshnessState {
    /// Nothing has been inserted yet.
    NoData,
    Live,
    Stale,
}

impl FreshnessState {
    pub fn is_live(self) -> bool {
        self == Self::Live
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FreshnessMonitor {
    timeout: Duration,
    state: FreshnessState,
    /// Instant at which Live turns Stale. Re-armed on every insert.
    deadline: Option<Instant>,
    /// Wall-clock ms of the last successful insert.
    last_update: Option<i64>,
}

impl FreshnessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: FreshnessState::NoData,
            deadline: None,
            last_update: None,
        }
    }

    pub fn state(&self) -> FreshnessState {
        self.state
    }

    #[cfg(test)]
    pub fn last_update(&self) -> Option<i64> {
        self.last_update
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A reading was successfully inserted: go Live and re-arm the deadline.
    pub fn record_insert(&mut self, now: Instant, wall_ms: i64) {
        self.state = FreshnessState::Live;
        self.deadline = Some(now + self.timeout);
        self.last_update = Some(wall_ms);
    }

    /// Poll the deadline. Returns `true` if this call flipped Live to Stale.
    pub fn check(&mut self, now: Instant) -> bool {
        match (self.state, self.deadline) {
            (FreshnessState::Live, Some(deadline)) if now >= deadline => {
                self.state = FreshnessState::Stale;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Transport is down; don't wait out the timeout. Returns `true` if the
    /// state changed.
    pub fn force_stale(&mut self) -> bool {
        self.deadline = None;
        if self.state == FreshnessState::Live {
            self.state = FreshnessState::Stale;
            true
        } else {
            false
        }
    }

    /// Overlay the current state on the last accepted reading. Measurement fields are
    /// blanked unless Live; `last_update` always survives.
    pub fn current_snapshot(&self, current: Option<&Reading>) -> CurrentSnapshot {
        let mut snap = CurrentSnapshot {
            freshness: self.state,
            last_update: self.last_update,
            timestamp: current.map(|r| r.timestamp),
            timestamp_source: current.map(|r| r.timestamp_source),
            ..CurrentSnapshot::default()
        };
        if let (FreshnessState::Live, Some(r)) = (self.state, current) {
            snap.temperature = r.temperature;
            snap.humidity = r.humidity;
            snap.vpd = r.vpd;
            snap.ph = r.ph;
            snap.water_level = r.water_level;
            snap.reservoir_volume = r.reservoir_volume;
            snap.light_intensity = r.light_intensity;
            snap.vpd_pump_running = r.vpd_pump_running;
            snap.ph_adjusting = r.ph_adjusting;
        }
        snap
    }
}

impl Default for FreshnessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_TIMEOUT)
    }
}

/// The "current reading" cards: newest reading plus freshness.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSnapshot {
    pub freshness: FreshnessState,
    pub last_update: Option<i64>,
    pub timestamp: Option<i64>,
    pub timestamp_source: Option<TimestampSource>,
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

impl Default for CurrentSnapshot {
    fn default() -> Self {
        Self {
            freshness: FreshnessState::NoData,
            last_update: None,
            timestamp: None,
            timestamp_source: None,
            temperature: None,
            humidity: None,
            vpd: None,
            ph: None,
            water_level: None,
            reservoir_volume: None,
            light_intensity: None,
            vpd_pump_running: None,
            ph_adjusting: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Poll task
// ---------------------------------------------------------------------------

/// Spawn the periodic freshness check. Abort the handle to cancel; aborting
/// before the first tick is fine.
pub fn spawn(shared: SharedState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(interval_ms = interval.as_millis() as u64, "freshness monitor started");
        loop {
            ticker.tick().await;
            let mut st = shared.write().await;
            if st.tick_freshness(Instant::now()) {
                info!(
                    timeout_sec = st.freshness.timeout().as_secs(),
                    "telemetry stale: no reading within timeout"
                );
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
