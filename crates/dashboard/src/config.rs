//! TOML config file loading, env overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::connection::{parse_endpoint, Credentials, LinkParams};
use crate::freshness::{DEFAULT_POLL_INTERVAL, DEFAULT_STALE_TIMEOUT};
use crate::status::Thresholds;
use crate::store::{parse_window, DEFAULT_CAPACITY};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    pub endpoint: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive_sec")]
    pub keep_alive_sec: u64,
    #[serde(default = "default_reconnect_sec")]
    pub reconnect_sec: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Telemetry,
    Status,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    /// Link name; defaults to the kind.
    #[serde(default)]
    pub name: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub kind: ChannelKind,
}

impl ChannelEntry {
    pub fn link_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub capacity: usize,
    pub stale_timeout_sec: u64,
    pub freshness_poll_ms: u64,
    pub windows: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            stale_timeout_sec: DEFAULT_STALE_TIMEOUT.as_secs(),
            freshness_poll_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            windows: ["5m", "15m", "1h", "6h", "24h", "7d"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub topic: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            topic: "aero/control".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// History persistence is off unless set.
    pub db_url: Option<String>,
    pub retention: String,
    /// How often rows past retention are deleted.
    pub prune_interval: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_url: None,
            retention: "7d".to_string(),
            prune_interval: "1h".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

fn default_client_id() -> String {
    "hydro-dashboard".to_string()
}

fn default_keep_alive_sec() -> u64 {
    30
}

fn default_reconnect_sec() -> u64 {
    5
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.telemetry.stale_timeout_sec)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry.freshness_poll_ms)
    }

    pub fn retention(&self) -> Duration {
        parse_window(&self.history.retention).unwrap_or(Duration::from_secs(7 * 86_400))
    }

    pub fn prune_interval(&self) -> Duration {
        parse_window(&self.history.prune_interval).unwrap_or(Duration::from_secs(3600))
    }

    /// Configured chart windows with their durations, in config order.
    pub fn windows(&self) -> Vec<(String, Duration)> {
        self.telemetry
            .windows
            .iter()
            .filter_map(|w| parse_window(w).map(|d| (w.clone(), d)))
            .collect()
    }

    /// Connection parameters for one channel. Each link gets its own client id.
    pub fn link_params(&self, channel: &ChannelEntry) -> LinkParams {
        let credentials = self.broker.username.as_ref().map(|u| Credentials {
            username: u.clone(),
            password: self.broker.password.clone().unwrap_or_default(),
        });
        LinkParams {
            endpoint: self.broker.endpoint.clone(),
            credentials,
            client_id: format!("{}-{}", self.broker.client_id, channel.link_name()),
            topic: channel.topic.clone(),
            keep_alive: Duration::from_secs(self.broker.keep_alive_sec),
            reconnect: Duration::from_secs(self.broker.reconnect_sec),
        }
    }

    /// Apply env overrides. Credentials belong in the environment, not the file.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("MQTT_ENDPOINT") {
            self.broker.endpoint = v;
        }
        if let Some(v) = get("MQTT_USERNAME") {
            self.broker.username = Some(v);
        }
        if let Some(v) = get("MQTT_PASSWORD") {
            self.broker.password = Some(v);
        }
        if let Some(port) = get("WEB_PORT").and_then(|v| v.parse().ok()) {
            self.web.port = port;
        }
        if let Some(v) = get("DB_URL") {
            self.history.db_url = Some(v);
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole config. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_broker(&mut errors);
        self.validate_channels(&mut errors);
        self.validate_telemetry(&mut errors);
        self.validate_thresholds(&mut errors);

        if self.commands.topic.trim().is_empty() {
            errors.push("commands.topic is empty".to_string());
        } else if self.commands.topic.contains(['+', '#']) {
            errors.push(format!(
                "commands.topic '{}' must not contain wildcards",
                self.commands.topic
            ));
        }

        if parse_window(&self.history.retention).is_none() {
            errors.push(format!(
                "history.retention '{}' is not a duration like 7d or 12h",
                self.history.retention
            ));
        }
        if parse_window(&self.history.prune_interval).is_none() {
            errors.push(format!(
                "history.prune_interval '{}' is not a duration like 1h or 30m",
                self.history.prune_interval
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        let b = &self.broker;
        if let Err(e) = parse_endpoint(&b.endpoint) {
            errors.push(format!("broker.endpoint: {e}"));
        }
        if b.client_id.trim().is_empty() {
            errors.push("broker.client_id is empty".to_string());
        }
        if b.reconnect_sec == 0 {
            errors.push("broker.reconnect_sec must be positive".to_string());
        }
        if b.password.is_some() && b.username.is_none() {
            errors.push("broker.password set without broker.username".to_string());
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        if !self
            .channels
            .iter()
            .any(|c| c.kind == ChannelKind::Telemetry)
        {
            errors.push("at least one telemetry channel is required".to_string());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, c) in self.channels.iter().enumerate() {
            let name = c.link_name();
            if name.trim().is_empty() {
                errors.push(format!("channels[{i}]: name is empty"));
            } else if !seen.insert(name) {
                errors.push(format!(
                    "channel '{name}': duplicate name (set `name` to tell channels apart)"
                ));
            }
            if c.topic.trim().is_empty() {
                errors.push(format!("channel '{name}': topic is empty"));
            }
        }
    }

    fn validate_telemetry(&self, errors: &mut Vec<String>) {
        let t = &self.telemetry;
        if t.capacity == 0 {
            errors.push("telemetry.capacity must be positive".to_string());
        }
        if t.stale_timeout_sec == 0 {
            errors.push("telemetry.stale_timeout_sec must be positive".to_string());
        }
        if t.freshness_poll_ms == 0 {
            errors.push("telemetry.freshness_poll_ms must be positive".to_string());
        }
        if t.windows.is_empty() {
            errors.push("telemetry.windows is empty".to_string());
        }
        for w in &t.windows {
            if parse_window(w).is_none() {
                errors.push(format!("telemetry.windows: '{w}' is not a valid window"));
            }
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        if t.vpd_min >= t.vpd_max {
            errors.push(format!(
                "thresholds: vpd_min ({}) must be below vpd_max ({})",
                t.vpd_min, t.vpd_max
            ));
        }
        if t.ph_min >= t.ph_max {
            errors.push(format!(
                "thresholds: ph_min ({}) must be below ph_max ({})",
                t.ph_min, t.ph_max
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply env overrides, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        channels = config.channels.len(),
        capacity = config.telemetry.capacity,
        history = config.history.db_url.is_some(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[broker]
endpoint = "mqtt://broker.local:1883"

[[channels]]
topic = "aero/sensors"
"#;

    fn valid_config() -> Config {
        toml::from_str(MINIMAL).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_minimal_config_uses_defaults() {
        let cfg = valid_config();
        cfg.validate().unwrap();
        assert_eq!(cfg.broker.client_id, "hydro-dashboard");
        assert_eq!(cfg.broker.reconnect_sec, 5);
        assert_eq!(cfg.channels[0].kind, ChannelKind::Telemetry);
        assert_eq!(cfg.telemetry.capacity, 1000);
        assert_eq!(cfg.stale_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.windows().len(), 6);
        assert_eq!(cfg.commands.topic, "aero/control");
        assert_eq!(cfg.web.port, 8080);
        assert!(cfg.history.db_url.is_none());
        assert_eq!(cfg.prune_interval(), Duration::from_secs(3600));
        assert_eq!(cfg.thresholds, Thresholds::default());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[broker]
endpoint = "wss://broker.example.com:8884/mqtt"
client_id = "greenhouse-a"
keep_alive_sec = 60
reconnect_sec = 10

[[channels]]
topic = "aero/sensors"

[[channels]]
topic = "aero/status"
kind = "status"

[telemetry]
capacity = 20
stale_timeout_sec = 30
windows = ["5m", "1h"]

[commands]
topic = "aero/cmd"

[thresholds]
ph_min = 5.8

[history]
db_url = "sqlite::memory:"
retention = "24h"
prune_interval = "15m"

[web]
port = 9090
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.channels[1].link_name(), "status");
        assert_eq!(cfg.telemetry.capacity, 20);
        assert_eq!(cfg.telemetry.freshness_poll_ms, 1000);
        assert_eq!(cfg.thresholds.ph_min, 5.8);
        assert_eq!(cfg.thresholds.ph_max, 6.5);
        assert_eq!(cfg.retention(), Duration::from_secs(86_400));
        assert_eq!(cfg.prune_interval(), Duration::from_secs(900));
        assert_eq!(cfg.web.port, 9090);
    }

    #[test]
    fn missing_broker_fails_to_parse() {
        assert!(toml::from_str::<Config>("[[channels]]\ntopic = \"t\"").is_err());
    }

    // -- Link params ------------------------------------------------------

    #[test]
    fn link_params_per_channel() {
        let mut cfg = valid_config();
        cfg.broker.username = Some("grower".into());
        cfg.broker.password = Some("pw".into());
        let p = cfg.link_params(&cfg.channels[0]);
        assert_eq!(p.client_id, "hydro-dashboard-telemetry");
        assert_eq!(p.topic, "aero/sensors");
        assert_eq!(p.reconnect, Duration::from_secs(5));
        assert_eq!(p.credentials.unwrap().password, "pw");
    }

    // -- Env overrides ----------------------------------------------------

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("MQTT_ENDPOINT", "mqtts://secure.local"),
            ("MQTT_USERNAME", "u"),
            ("MQTT_PASSWORD", "p"),
            ("WEB_PORT", "3000"),
            ("DB_URL", "sqlite:history.db"),
        ]
        .into_iter()
        .collect();
        let mut cfg = valid_config();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.broker.endpoint, "mqtts://secure.local");
        assert_eq!(cfg.broker.username.as_deref(), Some("u"));
        assert_eq!(cfg.web.port, 3000);
        assert_eq!(cfg.history.db_url.as_deref(), Some("sqlite:history.db"));
        cfg.validate().unwrap();
    }

    #[test]
    fn bad_port_override_ignored() {
        let mut cfg = valid_config();
        cfg.apply_overrides(|k| (k == "WEB_PORT").then(|| "http".to_string()));
        assert_eq!(cfg.web.port, 8080);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn malformed_endpoint_rejected() {
        let mut cfg = valid_config();
        cfg.broker.endpoint = "broker.local".into();
        assert_validation_err(&cfg, "broker.endpoint");
    }

    #[test]
    fn requires_telemetry_channel() {
        let mut cfg = valid_config();
        cfg.channels[0].kind = ChannelKind::Status;
        assert_validation_err(&cfg, "at least one telemetry channel");
    }

    #[test]
    fn duplicate_channel_names_rejected() {
        let mut cfg = valid_config();
        cfg.channels.push(cfg.channels[0].clone());
        assert_validation_err(&cfg, "duplicate name");
    }

    #[test]
    fn bad_window_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.windows.push("fortnight".into());
        assert_validation_err(&cfg, "'fortnight' is not a valid window");
    }

    #[test]
    fn bad_prune_interval_rejected() {
        let mut cfg = valid_config();
        cfg.history.prune_interval = "often".into();
        assert_validation_err(&cfg, "history.prune_interval");
    }

    #[test]
    fn wildcard_command_topic_rejected() {
        let mut cfg = valid_config();
        cfg.commands.topic = "aero/#".into();
        assert_validation_err(&cfg, "wildcards");
    }

    #[test]
    fn inverted_threshold_band_rejected() {
        let mut cfg = valid_config();
        cfg.thresholds.ph_min = 7.0;
        assert_validation_err(&cfg, "ph_min");
    }

    #[test]
    fn password_without_username_rejected() {
        let mut cfg = valid_config();
        cfg.broker.password = Some("pw".into());
        assert_validation_err(&cfg, "without broker.username");
    }

    #[test]
    fn collects_all_errors() {
        let mut cfg = valid_config();
        cfg.broker.endpoint = String::new();
        cfg.telemetry.capacity = 0;
        cfg.telemetry.stale_timeout_sec = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("hydro-config-{}.toml", std::process::id()));
        std::fs::write(&path, MINIMAL).unwrap();
        let cfg = load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.channels.len(), 1);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load("/nonexistent/hydro.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
