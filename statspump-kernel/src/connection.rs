//! Per-VPN pub/sub connections behind a message bus.
//!
//! The pump talks to brokers through [`PubSubClient`] / [`PubSubConnector`];
//! the production implementation is MQTT 5 via rumqttc, tests plug in the
//! devkit's in-memory broker.
//!
//! A bus with a fixed VPN may use the host's default listener for it. Any
//! other VPN needs its own listener port in `vpn_ports`; without one the
//! connection is refused rather than landing on another VPN's listener.

use async_trait::async_trait;
use parking_lot::RwLock;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use rumqttc::Outgoing;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{PumpError, Result};
use crate::message::WireMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[async_trait]
pub trait PubSubClient: Send + Sync {
    async fn publish(&self, message: &WireMessage) -> Result<()>;

    fn state(&self) -> ConnectionState;

    async fn disconnect(&self) {}
}

/// Where and as whom a per-VPN connection logs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEndpoint {
    pub host: String,
    pub port: Option<u16>,
    pub vpn: String,
    pub username: String,
    pub password: String,
}

pub trait PubSubConnector: Send + Sync {
    /// Starts a connection; it may still be connecting when returned.
    fn connect(&self, endpoint: &BusEndpoint) -> Result<Arc<dyn PubSubClient>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub vpn: String,
    pub state: ConnectionState,
    pub published: u64,
    pub failed: u64,
    pub requested_during_reconnection: bool,
}

pub struct VpnConnection {
    pub vpn: String,
    client: Arc<dyn PubSubClient>,
    requested_during_reconnection: AtomicBool,
    published: AtomicU64,
    failed: AtomicU64,
}

impl VpnConnection {
    pub fn new(vpn: impl Into<String>, client: Arc<dyn PubSubClient>) -> Self {
        Self {
            vpn: vpn.into(),
            client,
            requested_during_reconnection: AtomicBool::new(false),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Notes that traffic was dropped while the connection was down.
    pub fn set_requested_during_reconnection(&self) {
        if !self.requested_during_reconnection.swap(true, Ordering::Relaxed) {
            debug!("VPN {} requested while reconnecting", self.vpn);
        }
    }

    pub fn was_requested_during_reconnection(&self) -> bool {
        self.requested_during_reconnection.load(Ordering::Relaxed)
    }

    pub async fn publish(&self, message: &WireMessage) -> Result<()> {
        match self.client.publish(message).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                self.requested_during_reconnection.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            vpn: self.vpn.clone(),
            state: self.state(),
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requested_during_reconnection: self.was_requested_during_reconnection(),
        }
    }
}

/// Lazily opened connections of one bus, one per VPN.
pub struct VpnConnectionManager {
    host: String,
    fixed_vpn: Option<String>,
    username: String,
    password: String,
    vpn_ports: HashMap<String, u16>,
    connector: Arc<dyn PubSubConnector>,
    connections: RwLock<BTreeMap<String, Arc<VpnConnection>>>,
}

impl VpnConnectionManager {
    pub fn new(
        host: &str,
        fixed_vpn: Option<&str>,
        username: &str,
        password: &str,
        vpn_ports: HashMap<String, u16>,
        connector: Arc<dyn PubSubConnector>,
    ) -> Self {
        Self {
            host: host.to_string(),
            fixed_vpn: fixed_vpn.map(str::to_string),
            username: username.to_string(),
            password: password.to_string(),
            vpn_ports,
            connector,
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, vpn: &str) -> Option<Arc<VpnConnection>> {
        self.connections.read().get(vpn).cloned()
    }

    pub fn get_or_connect(&self, vpn: &str) -> Result<Arc<VpnConnection>> {
        if let Some(existing) = self.get(vpn) {
            return Ok(existing);
        }
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(vpn) {
            return Ok(existing.clone());
        }
        let endpoint = BusEndpoint {
            host: self.host.clone(),
            port: self.port_for(vpn)?,
            vpn: vpn.to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
        };
        info!("Opening connection to {} VPN {}", self.host, vpn);
        let connection = Arc::new(VpnConnection::new(vpn, self.connector.connect(&endpoint)?));
        connections.insert(vpn.to_string(), connection.clone());
        Ok(connection)
    }

    /// Listener port of `vpn`; `None` means the host's default listener.
    fn port_for(&self, vpn: &str) -> Result<Option<u16>> {
        if let Some(port) = self.vpn_ports.get(vpn) {
            return Ok(Some(*port));
        }
        if self.fixed_vpn.as_deref() == Some(vpn) {
            return Ok(None);
        }
        Err(PumpError::Config(format!("{}: no MQTT listener port configured for VPN {}", self.host, vpn)))
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections.read().values().map(|c| c.snapshot()).collect()
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<VpnConnection>> = self.connections.read().values().cloned().collect();
        for connection in connections {
            connection.client.disconnect().await;
        }
    }
}

/// Splits `host[:port]`, defaulting to the MQTT port.
pub fn split_host_port(host: &str, default_port: u16) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        None => (host.to_string(), default_port),
    }
}

/// MQTT 5 properties carrying the bus framing of `message`.
pub fn publish_properties(message: &WireMessage) -> PublishProperties {
    let mut user_properties: Vec<(String, String)> =
        message.properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    user_properties.push(("encoding".to_string(), message.encoding.key().to_string()));
    user_properties.push(("dmq-eligible".to_string(), message.dmq_eligible.to_string()));
    if message.compressed {
        user_properties.push(("content-encoding".to_string(), "zlib".to_string()));
    }
    let expiry = (message.ttl_ms > 0).then(|| u32::try_from(message.ttl_ms.div_ceil(1000)).unwrap_or(u32::MAX));
    PublishProperties {
        message_expiry_interval: expiry,
        content_type: Some(message.content_type.to_string()),
        user_properties,
        ..Default::default()
    }
}

/// MQTT client for one VPN, event loop driven by its own task.
pub struct MqttVpnClient {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    ever_connected: Arc<AtomicBool>,
}

#[async_trait]
impl PubSubClient for MqttVpnClient {
    async fn publish(&self, message: &WireMessage) -> Result<()> {
        trace!("MQTT publish {} ({} bytes, ttl {}ms)", message.topic, message.payload.len(), message.ttl_ms);
        self.client
            .publish_with_properties(
                message.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                message.payload.clone(),
                publish_properties(message),
            )
            .await
            .map_err(|e| PumpError::Publish(format!("{}: {e}", message.topic)))
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::Relaxed) {
            ConnectionState::Connected
        } else if self.ever_connected.load(Ordering::Relaxed) {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connecting
        }
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
    }
}

pub struct MqttConnector {
    keep_alive: Duration,
}

impl MqttConnector {
    pub const DEFAULT_PORT: u16 = 1883;

    pub fn new(keep_alive: Duration) -> Self {
        Self { keep_alive }
    }
}

impl PubSubConnector for MqttConnector {
    fn connect(&self, endpoint: &BusEndpoint) -> Result<Arc<dyn PubSubClient>> {
        let (host, default_port) = split_host_port(&endpoint.host, Self::DEFAULT_PORT);
        let port = endpoint.port.unwrap_or(default_port);
        let client_id = format!("statspump-{}-{}", endpoint.vpn, Uuid::new_v4().simple());
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(self.keep_alive);
        if !endpoint.username.is_empty() {
            opts.set_credentials(endpoint.username.clone(), endpoint.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let ever_connected = Arc::new(AtomicBool::new(false));
        let (flag, ever, vpn) = (connected.clone(), ever_connected.clone(), endpoint.vpn.clone());

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected for VPN {}", vpn);
                        flag.store(true, Ordering::Relaxed);
                        ever.store(true, Ordering::Relaxed);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        flag.store(false, Ordering::Relaxed);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if flag.swap(false, Ordering::Relaxed) {
                            warn!("MQTT connection for VPN {} lost: {}", vpn, e);
                        } else {
                            debug!("MQTT connection for VPN {} failed: {}", vpn, e);
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Ok(Arc::new(MqttVpnClient { client, connected, ever_connected }) as Arc<dyn PubSubClient>)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use statspump_devkit::MockBroker;

    fn wire(topic: &str) -> WireMessage {
        WireMessage {
            topic: topic.to_string(),
            payload: b"{}".to_vec(),
            content_type: "application/json",
            encoding: crate::containers::EncodingKind::Json,
            compressed: false,
            ttl_ms: 0,
            dmq_eligible: false,
            properties: BTreeMap::new(),
        }
    }

    fn ports(entries: &[(&str, u16)]) -> HashMap<String, u16> {
        entries.iter().map(|(vpn, port)| (vpn.to_string(), *port)).collect()
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("broker:1884", 1883), ("broker".to_string(), 1884));
        assert_eq!(split_host_port("broker", 1883), ("broker".to_string(), 1883));
        assert_eq!(split_host_port("broker:abc", 1883), ("broker:abc".to_string(), 1883));
    }

    #[tokio::test]
    async fn connections_are_opened_once_per_vpn() {
        let broker = MockBroker::new();
        let manager =
            VpnConnectionManager::new("h", None, "u", "p", ports(&[("a", 1884), ("b", 1885)]), Arc::new(broker.clone()));
        let a = manager.get_or_connect("a").unwrap();
        let again = manager.get_or_connect("a").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        manager.get_or_connect("b").unwrap();
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(manager.snapshot().len(), 2);

        a.publish(&wire("STATS/x")).await.unwrap();
        assert_eq!(broker.published_on("h", "a").len(), 1);
        assert_eq!(a.snapshot().published, 1);
    }

    #[test]
    fn vpn_without_listener_port_is_refused() {
        let broker = MockBroker::new();
        let origin = VpnConnectionManager::new("h", None, "u", "p", ports(&[("a", 1884)]), Arc::new(broker.clone()));
        let err = origin.get_or_connect("tenant").err().unwrap();
        assert!(err.is_config());
        assert!(origin.get("tenant").is_none());
        assert_eq!(broker.connect_count(), 0);

        let fixed = VpnConnectionManager::new("h", Some("collector"), "u", "p", HashMap::new(), Arc::new(broker.clone()));
        assert!(fixed.get_or_connect("collector").is_ok());
        assert!(fixed.get_or_connect("other").is_err());
    }

    #[tokio::test]
    async fn disconnected_client_reports_state() {
        let broker = MockBroker::new();
        let manager = VpnConnectionManager::new("h", Some("v"), "u", "p", HashMap::new(), Arc::new(broker.clone()));
        let conn = manager.get_or_connect("v").unwrap();
        broker.client_for("h", "v").set_connected(false);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
        conn.set_requested_during_reconnection();
        assert!(conn.was_requested_during_reconnection());
    }

    #[tokio::test]
    async fn framing_travels_as_publish_properties() {
        let broker = MockBroker::new();
        let manager = VpnConnectionManager::new("h", Some("v"), "u", "p", HashMap::new(), Arc::new(broker.clone()));
        let mut message = wire("STATS/x");
        message.ttl_ms = 1500;
        message.dmq_eligible = true;
        message.compressed = true;
        message.properties.insert("poller".to_string(), "VpnStats".to_string());
        message.properties.insert("vpn".to_string(), "#config-sync".to_string());
        manager.get_or_connect("v").unwrap().publish(&message).await.unwrap();

        let published = broker.published_on("h", "v");
        let sent = &published[0];
        assert_eq!(sent.properties.message_expiry_interval, Some(2));
        assert_eq!(sent.properties.content_type.as_deref(), Some("application/json"));
        assert_eq!(sent.user_property("poller"), Some("VpnStats"));
        assert_eq!(sent.user_property("vpn"), Some("#config-sync"));
        assert_eq!(sent.user_property("encoding"), Some("json"));
        assert_eq!(sent.user_property("dmq-eligible"), Some("true"));
        assert_eq!(sent.user_property("content-encoding"), Some("zlib"));

        assert_eq!(publish_properties(&wire("t")).message_expiry_interval, None);
        assert!(publish_properties(&wire("t")).user_properties.iter().all(|(k, _)| k != "content-encoding"));
    }
}
