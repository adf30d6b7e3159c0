//! The read facade and command path handed to consumers. Owns the links, the
//! freshness task and the history prune task; `dispose` releases all of them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::command::{Command, PublishError};
use crate::config::{ChannelKind, Config};
use crate::connection::{ConnectionManager, LinkParams};
use crate::db::{self, Db};
use crate::freshness;
use crate::reading::{now_millis, Reading};
use crate::state::{DashboardView, SharedState, SystemState};
use crate::status::Thresholds;

struct Link {
    manager: ConnectionManager,
    params: LinkParams,
    kind: ChannelKind,
}

pub struct Dashboard {
    shared: SharedState,
    links: Vec<Link>,
    thresholds: Thresholds,
    windows: Vec<(String, Duration)>,
    command_topic: String,
    poll_interval: Duration,
    freshness_task: Mutex<Option<JoinHandle<()>>>,
    db: Option<Db>,
    retention: Duration,
    prune_interval: Duration,
    prune_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dashboard {
    pub fn new(cfg: &Config, db: Option<Db>) -> Self {
        let mut st = SystemState::new(cfg.telemetry.capacity, cfg.stale_timeout());
        for ch in &cfg.channels {
            st.register_link(ch.link_name(), &ch.topic, ch.kind);
        }
        let shared: SharedState = Arc::new(RwLock::new(st));

        let links = cfg
            .channels
            .iter()
            .map(|ch| Link {
                manager: ConnectionManager::new(
                    ch.link_name(),
                    ch.kind,
                    Arc::clone(&shared),
                    db.clone(),
                ),
                params: cfg.link_params(ch),
                kind: ch.kind,
            })
            .collect();

        Self {
            shared,
            links,
            thresholds: cfg.thresholds.clone(),
            windows: cfg.windows(),
            command_topic: cfg.commands.topic.clone(),
            poll_interval: cfg.poll_interval(),
            freshness_task: Mutex::new(None),
            db,
            retention: cfg.retention(),
            prune_interval: cfg.prune_interval(),
            prune_task: Mutex::new(None),
        }
    }

    pub fn shared(&self) -> SharedState {
        Arc::clone(&self.shared)
    }

    /// Start the background tasks and open every link.
    pub async fn start(&self) {
        {
            let mut task = self.freshness_task.lock().await;
            if task.is_none() {
                *task = Some(freshness::spawn(self.shared(), self.poll_interval));
            }
        }
        if let Some(history) = &self.db {
            let mut task = self.prune_task.lock().await;
            if task.is_none() {
                *task = Some(db::spawn_prune(
                    history.clone(),
                    self.retention,
                    self.prune_interval,
                ));
            }
        }
        for link in &self.links {
            link.manager.connect(link.params.clone()).await;
        }
        self.shared
            .write()
            .await
            .record_system(format!("dashboard started with {} link(s)", self.links.len()));
    }

    /// Seed the buffer from persisted history.
    pub async fn backfill(&self, readings: Vec<Reading>) -> usize {
        let mut st = self.shared.write().await;
        let n = st.backfill(readings);
        if n > 0 {
            let newest = st.series.latest().map(|r| r.timestamp);
            info!(readings = n, newest = ?newest, "history backfilled");
        }
        n
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub async fn view(&self) -> DashboardView {
        self.shared.read().await.to_view(&self.thresholds)
    }

    /// Readings inside `window` (newest-relative to now), or the whole buffer.
    pub async fn history(&self, window: Option<Duration>) -> Vec<Reading> {
        let st = self.shared.read().await;
        match window {
            Some(w) => st.series.query_range(w, now_millis()),
            None => st.series.snapshot(),
        }
    }

    pub fn windows(&self) -> &[(String, Duration)] {
        &self.windows
    }

    /// Duration of a configured window label.
    pub fn window(&self, label: &str) -> Option<Duration> {
        self.windows
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, d)| *d)
    }

    // -----------------------------------------------------------------------
    // Command path
    // -----------------------------------------------------------------------

    /// Publish on the first telemetry link. Never touches inbound state
    /// beyond the event log.
    pub async fn publish(&self, cmd: &Command) -> Result<(), PublishError> {
        let result = match self.links.iter().find(|l| l.kind == ChannelKind::Telemetry) {
            Some(link) => match cmd.to_payload() {
                Ok(payload) => link.manager.publish(&self.command_topic, payload).await,
                Err(e) => Err(e),
            },
            None => Err(PublishError::NotConnected),
        };

        let mut st = self.shared.write().await;
        match &result {
            Ok(()) => {
                info!(command = %cmd.describe(), topic = %self.command_topic, "command published");
                st.record_command(format!("sent {}", cmd.describe()));
            }
            Err(e) => {
                warn!(command = %cmd.describe(), error = %e, "command not published");
                st.record_command(format!("failed {}: {e}", cmd.describe()));
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Replace one link's parameters. `None` for an unknown link, otherwise
    /// whether the link was rebuilt.
    pub async fn reconfigure(&self, link: &str, params: LinkParams) -> Option<bool> {
        let l = self.links.iter().find(|l| l.manager.name() == link)?;
        Some(l.manager.reconfigure(params).await)
    }

    /// Close every transport and cancel the background tasks. Idempotent.
    pub async fn dispose(&self) {
        if let Some(task) = self.freshness_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.prune_task.lock().await.take() {
            task.abort();
        }
        for link in &self.links {
            link.manager.dispose().await;
        }
    }

    #[cfg(test)]
    fn closed_transports(&self) -> usize {
        self.links.iter().map(|l| l.manager.closed_transports()).sum()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
