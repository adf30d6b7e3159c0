//! Broker links. One `ConnectionManager` per channel; each owns at most one
//! live transport (an `AsyncClient` plus the task polling its `EventLoop`).
//!
//! Every state write from a transport task happens under the state lock and
//! only if the task's generation is still current, so callbacks from a torn
//! down transport can never touch state after `reconfigure` or `dispose`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode, Transport as MqttTransport,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::command::PublishError;
use crate::config::ChannelKind;
use crate::db::Db;
use crate::reading::now_millis;
use crate::state::{Ingested, SharedState};
use crate::store::InsertOutcome;

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 10;

// ---------------------------------------------------------------------------
// States & events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
        }
    }
}

/// Transport lifecycle notifications, applied to `SystemState`.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Offline,
    /// Transport torn down locally (dispose or reconfigure).
    Closed,
    TransportError { message: String, offline: bool },
}

// ---------------------------------------------------------------------------
// Endpoint parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum EndpointError {
    #[error("endpoint is empty")]
    Empty,
    #[error("endpoint '{0}' has no scheme (expected e.g. mqtt://host:1883)")]
    MissingScheme(String),
    #[error("unsupported endpoint scheme '{0}'")]
    Scheme(String),
    #[error("endpoint '{0}' has no host")]
    MissingHost(String),
    #[error("endpoint '{0}' has an invalid port")]
    Port(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    #[cfg(feature = "websocket")]
    Ws,
    #[cfg(feature = "websocket")]
    Wss,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Self::Tcp => 1883,
            Self::Tls => 8883,
            #[cfg(feature = "websocket")]
            Self::Ws => 80,
            #[cfg(feature = "websocket")]
            Self::Wss => 443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Only meaningful for websocket transports.
    pub path: String,
}

impl Endpoint {
    /// Address handed to rumqttc. Websocket transports want the full URL.
    fn broker_addr(&self) -> String {
        match self.scheme {
            Scheme::Tcp | Scheme::Tls => self.host.clone(),
            #[cfg(feature = "websocket")]
            Scheme::Ws => format!("ws://{}:{}{}", self.host, self.port, self.path),
            #[cfg(feature = "websocket")]
            Scheme::Wss => format!("wss://{}:{}{}", self.host, self.port, self.path),
        }
    }
}

/// Parse `scheme://host[:port][/path]`. Accepts `mqtt`/`tcp`, `mqtts`/`ssl`,
/// and with the `websocket` feature `ws`/`wss` (path defaults to `/mqtt`).
pub fn parse_endpoint(uri: &str) -> Result<Endpoint, EndpointError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(EndpointError::Empty);
    }
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| EndpointError::MissingScheme(uri.to_string()))?;

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "mqtt" | "tcp" => Scheme::Tcp,
        "mqtts" | "ssl" | "tls" => Scheme::Tls,
        #[cfg(feature = "websocket")]
        "ws" => Scheme::Ws,
        #[cfg(feature = "websocket")]
        "wss" => Scheme::Wss,
        other => return Err(EndpointError::Scheme(other.to_string())),
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| EndpointError::Port(uri.to_string()))?;
            (h, port)
        }
        None => (authority, scheme.default_port()),
    };
    if host.is_empty() {
        return Err(EndpointError::MissingHost(uri.to_string()));
    }

    let path = if path.is_empty() || path == "/" {
        "/mqtt".to_string()
    } else {
        path.to_string()
    };

    Ok(Endpoint {
        scheme,
        host: host.to_string(),
        port,
        path,
    })
}

// ---------------------------------------------------------------------------
// Link parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Everything needed to open one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkParams {
    pub endpoint: String,
    pub credentials: Option<Credentials>,
    pub client_id: String,
    pub topic: String,
    pub keep_alive: Duration,
    /// Pause before the transport retries after a failure.
    pub reconnect: Duration,
}

pub(crate) fn mqtt_options(params: &LinkParams, ep: &Endpoint) -> MqttOptions {
    let mut opts = MqttOptions::new(params.client_id.as_str(), ep.broker_addr(), ep.port);
    opts.set_keep_alive(params.keep_alive);
    opts.set_clean_session(true);
    match ep.scheme {
        Scheme::Tcp => {}
        Scheme::Tls => {
            opts.set_transport(MqttTransport::tls_with_default_config());
        }
        #[cfg(feature = "websocket")]
        Scheme::Ws => {
            opts.set_transport(MqttTransport::Ws);
        }
        #[cfg(feature = "websocket")]
        Scheme::Wss => {
            opts.set_transport(MqttTransport::wss_with_default_config());
        }
    }
    if let Some(c) = &params.credentials {
        opts.set_credentials(c.username.as_str(), c.password.as_str());
    }
    opts
}

/// Network-level failures show as Offline; refusals and protocol errors as
/// Disconnected.
pub(crate) fn is_offline(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => true,
        ConnectionError::Io(e) => !matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::PermissionDenied
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A live client and its poll task. Dropping it queues a DISCONNECT and aborts
/// the poll task at once, so the request is normally never flushed and the
/// broker sees the socket close without one. Each transport is closed exactly
/// once whichever path drops it.
struct Transport {
    client: AsyncClient,
    task: JoinHandle<()>,
    closed: Arc<AtomicUsize>,
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.client.try_disconnect();
        self.task.abort();
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

struct Inner {
    params: Option<LinkParams>,
    transport: Option<Transport>,
}

pub struct ConnectionManager {
    name: String,
    kind: ChannelKind,
    shared: SharedState,
    db: Option<Db>,
    /// Serialises connect/reconfigure/dispose.
    inner: Mutex<Inner>,
    generation: Arc<AtomicU64>,
    closed: Arc<AtomicUsize>,
}

impl ConnectionManager {
    pub fn new(name: &str, kind: ChannelKind, shared: SharedState, db: Option<Db>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            shared,
            db,
            inner: Mutex::new(Inner {
                params: None,
                transport: None,
            }),
            generation: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of transports closed so far.
    #[cfg(test)]
    pub fn closed_transports(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open the link. A no-op while a transport already exists. A malformed
    /// endpoint leaves the link Disconnected with the error recorded.
    pub async fn connect(&self, params: LinkParams) {
        let mut inner = self.inner.lock().await;
        if inner.transport.is_some() {
            debug!(link = %self.name, "connect ignored: transport already open");
            return;
        }
        self.setup(&mut inner, params).await;
    }

    /// Tear down the current transport, then open one with `params`. An open
    /// link whose parameters are unchanged is left alone; returns whether the
    /// link was rebuilt.
    pub async fn reconfigure(&self, params: LinkParams) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.transport.is_some() && inner.params.as_ref() == Some(&params) {
            debug!(link = %self.name, "reconfigure skipped: parameters unchanged");
            return false;
        }
        self.teardown(&mut inner).await;
        info!(link = %self.name, topic = %params.topic, "reconfiguring link");
        self.setup(&mut inner, params).await;
        true
    }

    /// Close the transport and cancel its task. Safe to call repeatedly.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner).await;
        inner.params = None;
    }

    /// Fire-and-forget publish on this link's transport.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let client = {
            let inner = self.inner.lock().await;
            match &inner.transport {
                Some(t) => t.client.clone(),
                None => return Err(PublishError::NotConnected),
            }
        };
        let connected = self
            .shared
            .read()
            .await
            .links
            .get(&self.name)
            .is_some_and(|l| l.state == ConnectionState::Connected);
        if !connected {
            return Err(PublishError::NotConnected);
        }
        client.try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    async fn setup(&self, inner: &mut Inner, params: LinkParams) {
        inner.params = Some(params.clone());

        let endpoint = match parse_endpoint(&params.endpoint) {
            Ok(ep) => ep,
            Err(e) => {
                warn!(link = %self.name, error = %e, "cannot connect");
                let mut st = self.shared.write().await;
                st.record_link_failure(&self.name, e.to_string());
                return;
            }
        };

        let (client, eventloop) =
            AsyncClient::new(mqtt_options(&params, &endpoint), REQUEST_CAPACITY);

        let task = {
            let mut st = self.shared.write().await;
            if let Some(link) = st.links.get_mut(&self.name) {
                link.topic = params.topic.clone();
            }
            st.apply_link_event(&self.name, LinkEvent::Connecting);

            let link_task = LinkTask {
                name: self.name.clone(),
                kind: self.kind,
                topic: params.topic.clone(),
                reconnect: params.reconnect,
                shared: Arc::clone(&self.shared),
                db: self.db.clone(),
                generation: Arc::clone(&self.generation),
                owner: self.generation.load(Ordering::SeqCst),
            };
            tokio::spawn(link_task.run(client.clone(), eventloop))
        };

        info!(
            link = %self.name,
            host = %endpoint.host,
            port = endpoint.port,
            topic = %params.topic,
            "link opening"
        );
        inner.transport = Some(Transport {
            client,
            task,
            closed: Arc::clone(&self.closed),
        });
    }

    async fn teardown(&self, inner: &mut Inner) {
        let Some(transport) = inner.transport.take() else {
            return;
        };
        {
            let mut st = self.shared.write().await;
            // Invalidate the old task before it can take the lock again.
            self.generation.fetch_add(1, Ordering::SeqCst);
            st.apply_link_event(&self.name, LinkEvent::Closed);
        }
        drop(transport);
        debug!(link = %self.name, "transport closed");
    }
}

// ---------------------------------------------------------------------------
// Poll task
// ---------------------------------------------------------------------------

struct LinkTask {
    name: String,
    kind: ChannelKind,
    topic: String,
    reconnect: Duration,
    shared: SharedState,
    db: Option<Db>,
    generation: Arc<AtomicU64>,
    /// Generation this task was spawned under.
    owner: u64,
}

impl LinkTask {
    fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.owner
    }

    /// Apply an event if this task still owns the link.
    async fn apply(&self, event: LinkEvent) -> bool {
        let mut st = self.shared.write().await;
        if !self.is_current() {
            return false;
        }
        st.apply_link_event(&self.name, event);
        true
    }

    async fn run(self, client: AsyncClient, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if !self.apply(LinkEvent::Connected).await {
                        return;
                    }
                    info!(link = %self.name, "mqtt connected");
                    if let Err(e) = client.try_subscribe(self.topic.as_str(), QoS::AtLeastOnce) {
                        let message = format!("subscribe to {} failed: {e}", self.topic);
                        if !self
                            .apply(LinkEvent::TransportError {
                                message,
                                offline: false,
                            })
                            .await
                        {
                            return;
                        }
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure))
                    {
                        warn!(link = %self.name, topic = %self.topic, "subscription rejected");
                        let mut st = self.shared.write().await;
                        if self.is_current() {
                            st.record_error(format!(
                                "{}: subscription to {} rejected",
                                self.name, self.topic
                            ));
                        }
                    } else {
                        debug!(link = %self.name, topic = %self.topic, "subscribed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if !self.handle_payload(&p.payload).await {
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!(link = %self.name, "mqtt disconnected by broker");
                    if !self.apply(LinkEvent::Disconnected).await {
                        return;
                    }
                }
                Ok(_) => {}
                Err(ConnectionError::RequestsDone) => {
                    debug!(link = %self.name, "client dropped, poll task exiting");
                    return;
                }
                Err(e) => {
                    let offline = is_offline(&e);
                    warn!(
                        link = %self.name,
                        error = %e,
                        retry_sec = self.reconnect.as_secs(),
                        "mqtt error, reconnecting"
                    );
                    let failed = LinkEvent::TransportError {
                        message: e.to_string(),
                        offline,
                    };
                    if !self.apply(failed).await || !self.apply(LinkEvent::Reconnecting).await {
                        return;
                    }
                    sleep(self.reconnect).await;
                    if !self.apply(LinkEvent::Connecting).await {
                        return;
                    }
                }
            }
        }
    }

    /// Route one inbound payload. Returns `false` once the task is stale.
    async fn handle_payload(&self, payload: &[u8]) -> bool {
        let now = Instant::now();
        let wall_ms = now_millis();

        let persist = {
            let mut st = self.shared.write().await;
            if !self.is_current() {
                return false;
            }
            match self.kind {
                ChannelKind::Telemetry => {
                    match st.ingest_telemetry(&self.name, payload, now, wall_ms) {
                        Ok(Ingested {
                            reading,
                            outcome: InsertOutcome::Inserted,
                        }) => Some(reading),
                        Ok(Ingested { outcome, .. }) => {
                            debug!(link = %self.name, ?outcome, "reading not stored");
                            None
                        }
                        Err(e) => {
                            warn!(link = %self.name, error = %e, "dropping telemetry payload");
                            None
                        }
                    }
                }
                ChannelKind::Status => {
                    if let Err(e) = st.ingest_status(&self.name, payload, wall_ms) {
                        warn!(link = %self.name, error = %e, "dropping status payload");
                    }
                    None
                }
            }
        };

        // Best-effort; the buffer is the source of truth while running.
        if let (Some(db), Some(reading)) = (&self.db, persist) {
            if let Err(e) = db.insert_reading(&reading).await {
                warn!(link = %self.name, error = %e, "db: insert_reading failed");
            }
        }
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freshness::FreshnessState;
    use crate::state::SystemState;
    use tokio::sync::RwLock;

    fn test_shared() -> SharedState {
        let mut st = SystemState::new(10, Duration::from_secs(10));
        st.register_link("telemetry", "aero/sensors", ChannelKind::Telemetry);
        Arc::new(RwLock::new(st))
    }

    fn params(endpoint: &str) -> LinkParams {
        LinkParams {
            endpoint: endpoint.to_string(),
            credentials: None,
            client_id: "hydro-dashboard-telemetry".into(),
            topic: "aero/sensors".into(),
            keep_alive: Duration::from_secs(30),
            reconnect: Duration::from_secs(5),
        }
    }

    fn task(shared: SharedState, generation: Arc<AtomicU64>, owner: u64) -> LinkTask {
        LinkTask {
            name: "telemetry".into(),
            kind: ChannelKind::Telemetry,
            topic: "aero/sensors".into(),
            reconnect: Duration::from_secs(5),
            shared,
            db: None,
            generation,
            owner,
        }
    }

    // -- parse_endpoint -----------------------------------------------------

    #[test]
    fn parse_tcp_with_port() {
        let ep = parse_endpoint("mqtt://broker.local:1884").unwrap();
        assert_eq!(ep.scheme, Scheme::Tcp);
        assert_eq!(ep.host, "broker.local");
        assert_eq!(ep.port, 1884);
    }

    #[test]
    fn parse_default_ports() {
        assert_eq!(parse_endpoint("tcp://10.0.0.2").unwrap().port, 1883);
        let tls = parse_endpoint("mqtts://broker.example.com").unwrap();
        assert_eq!(tls.scheme, Scheme::Tls);
        assert_eq!(tls.port, 8883);
    }

    #[cfg(feature = "websocket")]
    #[test]
    fn parse_websocket_keeps_path() {
        let ep = parse_endpoint("wss://broker.example.com:8884/mqtt").unwrap();
        assert_eq!(ep.scheme, Scheme::Wss);
        assert_eq!(ep.port, 8884);
        assert_eq!(ep.broker_addr(), "wss://broker.example.com:8884/mqtt");

        let ep = parse_endpoint("ws://localhost:9001").unwrap();
        assert_eq!(ep.path, "/mqtt");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(parse_endpoint("  "), Err(EndpointError::Empty));
        assert!(matches!(
            parse_endpoint("broker.local:1883"),
            Err(EndpointError::MissingScheme(_))
        ));
        assert!(matches!(
            parse_endpoint("http://broker.local"),
            Err(EndpointError::Scheme(_))
        ));
        assert!(matches!(
            parse_endpoint("mqtt://:1883"),
            Err(EndpointError::MissingHost(_))
        ));
        assert!(matches!(
            parse_endpoint("mqtt://broker:notaport"),
            Err(EndpointError::Port(_))
        ));
        assert!(matches!(
            parse_endpoint("mqtt://broker:0"),
            Err(EndpointError::Port(_))
        ));
    }

    // -- options / error classification -------------------------------------

    #[test]
    fn options_carry_params() {
        let mut p = params("mqtt://broker.local:1884");
        p.credentials = Some(Credentials {
            username: "grower".into(),
            password: "secret".into(),
        });
        let ep = parse_endpoint(&p.endpoint).unwrap();
        let opts = mqtt_options(&p, &ep);
        assert_eq!(opts.client_id(), "hydro-dashboard-telemetry");
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            opts.credentials(),
            Some(("grower".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn network_errors_are_offline() {
        use std::io::{Error, ErrorKind};
        assert!(is_offline(&ConnectionError::NetworkTimeout));
        assert!(is_offline(&ConnectionError::Io(Error::from(
            ErrorKind::ConnectionReset
        ))));
        assert!(!is_offline(&ConnectionError::Io(Error::from(
            ErrorKind::ConnectionRefused
        ))));
        assert!(!is_offline(&ConnectionError::RequestsDone));
    }

    // -- manager lifecycle --------------------------------------------------

    #[tokio::test]
    async fn malformed_endpoint_fails_quietly() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        mgr.connect(params("not a uri")).await;

        let st = shared.read().await;
        assert_eq!(st.links["telemetry"].state, ConnectionState::Disconnected);
        assert!(st.last_error.is_some());
        drop(st);

        mgr.dispose().await;
        assert_eq!(mgr.closed_transports(), 0);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        mgr.connect(params("mqtt://127.0.0.1:1")).await;
        mgr.connect(params("mqtt://127.0.0.1:1")).await;
        mgr.dispose().await;
        assert_eq!(mgr.closed_transports(), 1);
    }

    #[tokio::test]
    async fn dispose_closes_exactly_once() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        // Dispose before anything was opened.
        mgr.dispose().await;
        assert_eq!(mgr.closed_transports(), 0);

        mgr.connect(params("mqtt://127.0.0.1:1")).await;
        mgr.dispose().await;
        mgr.dispose().await;
        assert_eq!(mgr.closed_transports(), 1);
        assert_eq!(
            shared.read().await.links["telemetry"].state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn reconfigure_replaces_transport() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        mgr.connect(params("mqtt://127.0.0.1:1")).await;

        let mut next = params("mqtt://127.0.0.1:2");
        next.topic = "aero/sensors/v2".into();
        assert!(mgr.reconfigure(next).await);
        assert_eq!(mgr.closed_transports(), 1);
        assert_eq!(shared.read().await.links["telemetry"].topic, "aero/sensors/v2");

        mgr.dispose().await;
        assert_eq!(mgr.closed_transports(), 2);
    }

    #[tokio::test]
    async fn reconfigure_with_same_params_is_noop() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        mgr.connect(params("mqtt://127.0.0.1:1")).await;
        assert!(!mgr.reconfigure(params("mqtt://127.0.0.1:1")).await);
        assert_eq!(mgr.closed_transports(), 0);

        // After dispose the same params open a fresh transport.
        mgr.dispose().await;
        assert!(mgr.reconfigure(params("mqtt://127.0.0.1:1")).await);
        mgr.dispose().await;
        assert_eq!(mgr.closed_transports(), 2);
    }

    #[tokio::test]
    async fn dropping_manager_closes_transport_once() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        mgr.connect(params("mqtt://127.0.0.1:1")).await;
        let closed = Arc::clone(&mgr.closed);
        drop(mgr);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_connection_shows_reconnecting() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        mgr.connect(params("mqtt://127.0.0.1:1")).await;

        let mut state = ConnectionState::Connecting;
        for _ in 0..100 {
            state = shared.read().await.links["telemetry"].state;
            if state == ConnectionState::Reconnecting {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, ConnectionState::Reconnecting);

        let st = shared.read().await;
        assert_eq!(st.last_error.as_ref().unwrap().link, "telemetry");
        assert!(st.links["telemetry"].last_error.is_some());
        drop(st);
        mgr.dispose().await;
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let shared = test_shared();
        let mgr = ConnectionManager::new("telemetry", ChannelKind::Telemetry, Arc::clone(&shared), None);
        let err = mgr.publish("aero/control", b"{}".to_vec()).await;
        assert!(matches!(err, Err(PublishError::NotConnected)));

        // Transport exists but the broker never acknowledged.
        mgr.connect(params("mqtt://127.0.0.1:1")).await;
        let err = mgr.publish("aero/control", b"{}".to_vec()).await;
        assert!(matches!(err, Err(PublishError::NotConnected)));
        mgr.dispose().await;
    }

    // -- generation guard ---------------------------------------------------

    #[tokio::test]
    async fn stale_task_cannot_mutate() {
        let shared = test_shared();
        let generation = Arc::new(AtomicU64::new(1));
        let old = task(Arc::clone(&shared), Arc::clone(&generation), 0);

        assert!(!old.apply(LinkEvent::Connected).await);
        assert!(
            !old.handle_payload(br#"{"timestamp":1700000000,"temperature":20}"#)
                .await
        );

        let st = shared.read().await;
        assert_eq!(st.links["telemetry"].state, ConnectionState::Disconnected);
        assert!(st.series.is_empty());
        assert_eq!(st.freshness.state(), FreshnessState::NoData);
    }

    #[tokio::test]
    async fn current_task_ingests() {
        let shared = test_shared();
        let generation = Arc::new(AtomicU64::new(3));
        let live = task(Arc::clone(&shared), Arc::clone(&generation), 3);

        assert!(live.apply(LinkEvent::Connected).await);
        assert!(
            live.handle_payload(br#"{"timestamp":1700000000,"temperature":20}"#)
                .await
        );
        // Malformed payload is dropped, task keeps going.
        assert!(live.handle_payload(b"{not json").await);

        let st = shared.read().await;
        assert_eq!(st.series.len(), 1);
        assert_eq!(st.freshness.state(), FreshnessState::Live);
        assert_eq!(st.links["telemetry"].state, ConnectionState::Connected);
        assert_eq!(st.links["telemetry"].decode_errors, 1);
    }
}
