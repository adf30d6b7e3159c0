use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ChannelKind;
use crate::connection::{ConnectionState, LinkEvent};
use crate::freshness::{CurrentSnapshot, FreshnessMonitor, FreshnessState};
use crate::reading::{decode_reading, decode_status, DecodeError, DeviceStatus, Reading};
use crate::status::{assess, Assessment, Thresholds};
use crate::store::{InsertOutcome, TimeSeries};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Everything the message handlers write and the API reads. Only the link
/// tasks and the freshness task mutate it.
pub struct SystemState {
    pub started_at: StdInstant,
    pub links: BTreeMap<String, LinkStatus>,
    /// First telemetry link; its state is the headline `connectionState`.
    pub primary: Option<String>,
    pub series: TimeSeries,
    /// Most recent reading accepted from a live link, whatever its timestamp.
    pub current: Option<Reading>,
    pub freshness: FreshnessMonitor,
    pub last_error: Option<LinkError>,
    pub last_decode_error: Option<String>,
    pub device_status: Option<DeviceStatusEntry>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub topic: String,
    pub kind: ChannelKind,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub messages: u64,
    pub decode_errors: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LinkError {
    pub link: String,
    pub message: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusEntry {
    #[serde(flatten)]
    pub status: DeviceStatus,
    pub received_at: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Connection,
    Command,
    Error,
    System,
}

/// A telemetry payload that made it through decoding.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub reading: Reading,
    pub outcome: InsertOutcome,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub connection_state: ConnectionState,
    pub freshness_state: FreshnessState,
    pub current_reading: CurrentSnapshot,
    pub last_error: Option<String>,
    pub last_decode_error: Option<String>,
    pub links: BTreeMap<String, LinkStatus>,
    pub device_status: Option<DeviceStatusEntry>,
    pub assessment: Assessment,
    pub buffered: usize,
    pub capacity: usize,
    pub uptime_secs: u64,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(capacity: usize, stale_timeout: std::time::Duration) -> Self {
        Self {
            started_at: StdInstant::now(),
            links: BTreeMap::new(),
            primary: None,
            series: TimeSeries::new(capacity),
            current: None,
            freshness: FreshnessMonitor::new(stale_timeout),
            last_error: None,
            last_decode_error: None,
            device_status: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Declare a channel link. The first telemetry link becomes primary.
    pub fn register_link(&mut self, name: &str, topic: &str, kind: ChannelKind) {
        if kind == ChannelKind::Telemetry && self.primary.is_none() {
            self.primary = Some(name.to_string());
        }
        self.links.insert(
            name.to_string(),
            LinkStatus {
                topic: topic.to_string(),
                kind,
                state: ConnectionState::Disconnected,
                last_error: None,
                messages: 0,
                decode_errors: 0,
                last_message: None,
            },
        );
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.primary
            .as_ref()
            .and_then(|p| self.links.get(p))
            .map(|l| l.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Apply a transport lifecycle event for one link.
    pub fn apply_link_event(&mut self, link: &str, event: LinkEvent) {
        let Some(status) = self.links.get_mut(link) else {
            warn!(link, "event for unknown link ignored");
            return;
        };
        let telemetry = status.kind == ChannelKind::Telemetry;

        let (next, transport_down) = match &event {
            LinkEvent::Connecting => (ConnectionState::Connecting, false),
            LinkEvent::Connected => (ConnectionState::Connected, false),
            LinkEvent::Reconnecting => (ConnectionState::Reconnecting, false),
            LinkEvent::Disconnected | LinkEvent::Closed => (ConnectionState::Disconnected, true),
            LinkEvent::Offline => (ConnectionState::Offline, true),
            LinkEvent::TransportError { offline: true, .. } => (ConnectionState::Offline, true),
            LinkEvent::TransportError { .. } => (ConnectionState::Disconnected, true),
        };
        let previous = status.state;
        status.state = next;

        match &event {
            LinkEvent::Connected => {
                status.last_error = None;
                if self.last_error.as_ref().is_some_and(|e| e.link == link) {
                    self.last_error = None;
                }
            }
            LinkEvent::TransportError { message, .. } => {
                status.last_error = Some(message.clone());
                self.last_error = Some(LinkError {
                    link: link.to_string(),
                    message: message.clone(),
                });
            }
            _ => {}
        }

        if transport_down && telemetry && self.freshness.force_stale() {
            debug!(link, "telemetry marked stale: transport down");
        }

        match event {
            LinkEvent::TransportError { message, .. } => {
                self.push_event(EventKind::Error, format!("{link}: {message}"));
            }
            _ if previous != next => {
                self.push_event(EventKind::Connection, format!("{link}: {}", next.as_str()));
            }
            _ => {}
        }
    }

    /// Record a transport failure that happened before a transport existed
    /// (e.g. malformed endpoint).
    pub fn record_link_failure(&mut self, link: &str, message: String) {
        self.apply_link_event(
            link,
            LinkEvent::TransportError {
                message,
                offline: false,
            },
        );
    }

    /// Decode and store one telemetry payload.
    pub fn ingest_telemetry(
        &mut self,
        link: &str,
        payload: &[u8],
        now: Instant,
        wall_ms: i64,
    ) -> Result<Ingested, DecodeError> {
        self.touch_link(link);

        let reading = match decode_reading(payload, wall_ms) {
            Ok(r) => r,
            Err(e) => {
                self.record_decode_error(link, &e);
                return Err(e);
            }
        };

        let outcome = self.series.insert(reading.clone());
        if outcome.is_success() {
            self.current = Some(reading.clone());
            let was_live = self.freshness.state().is_live();
            self.freshness.record_insert(now, wall_ms);
            if !was_live {
                self.push_event(EventKind::Reading, format!("{link}: telemetry live"));
            }
        }
        Ok(Ingested { reading, outcome })
    }

    /// Decode and keep the latest status-channel payload.
    pub fn ingest_status(
        &mut self,
        link: &str,
        payload: &[u8],
        wall_ms: i64,
    ) -> Result<(), DecodeError> {
        self.touch_link(link);
        match decode_status(payload) {
            Ok(status) => {
                self.device_status = Some(DeviceStatusEntry {
                    status,
                    received_at: wall_ms,
                });
                Ok(())
            }
            Err(e) => {
                self.record_decode_error(link, &e);
                Err(e)
            }
        }
    }

    /// Seed the buffer with persisted history. Does not make data Live.
    pub fn backfill(&mut self, readings: Vec<Reading>) -> usize {
        readings
            .into_iter()
            .map(|r| self.series.insert(r))
            .filter(|o| *o == InsertOutcome::Inserted)
            .count()
    }

    /// Freshness poll. Returns `true` if data just went stale.
    pub fn tick_freshness(&mut self, now: Instant) -> bool {
        if self.freshness.check(now) {
            self.push_event(EventKind::System, "telemetry stale".to_string());
            true
        } else {
            false
        }
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn current_snapshot(&self) -> CurrentSnapshot {
        self.freshness.current_snapshot(self.current.as_ref())
    }

    /// Build the JSON-serialisable read model.
    pub fn to_view(&self, thresholds: &Thresholds) -> DashboardView {
        let current = self.current_snapshot();
        DashboardView {
            connection_state: self.connection_state(),
            freshness_state: self.freshness.state(),
            assessment: assess(&current, thresholds),
            current_reading: current,
            last_error: self
                .last_error
                .as_ref()
                .map(|e| format!("{}: {}", e.link, e.message)),
            last_decode_error: self.last_decode_error.clone(),
            links: self.links.clone(),
            device_status: self.device_status.clone(),
            buffered: self.series.len(),
            capacity: self.series.capacity(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn touch_link(&mut self, link: &str) {
        if let Some(status) = self.links.get_mut(link) {
            status.messages += 1;
            status.last_message = Some(OffsetDateTime::now_utc());
        }
    }

    fn record_decode_error(&mut self, link: &str, err: &DecodeError) {
        if let Some(status) = self.links.get_mut(link) {
            status.decode_errors += 1;
        }
        let detail = format!("{link}: {err}");
        self.last_decode_error = Some(detail.clone());
        self.push_event(EventKind::Error, detail);
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
