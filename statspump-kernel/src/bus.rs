/**
 * MESSAGE BUSES - destinations a statistics message can be published to
 *
 * ROLE:
 * A MessageBus is one destination (broker host + optional fixed VPN +
 * encoding) with its own bounded FIFO queue. A single worker per bus drains
 * the queue (see republisher.rs), so publish order per bus equals enqueue
 * order.
 *
 * HOW IT WORKS:
 * - enqueue blocks when the queue is full: producers slow down instead of
 *   the pump buffering without bound
 * - self buses without a fixed VPN carry an allow/deny exception list
 * - buses are deduplicated on (host, VPN, encoding) by MessageBusRegistry
 */

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use crate::connection::{PubSubConnector, VpnConnectionManager};
use crate::containers::EncodingKind;
use crate::error::{PumpError, Result};
use crate::local_bus::LocalMgmtBusListener;
use crate::message::StatsMessage;
use crate::metrics::{QueueMetricsRegistry, QueueSnapshot, QueueStats};

/// VPN names starting with this marker are internal to the broker.
pub const RESERVED_VPN_MARKER: char = '#';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Mgmt,
    Local,
    #[serde(rename = "self")]
    SelfVpn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionAction {
    #[default]
    Allow,
    Deny,
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped.join(".*")))
        .map_err(|e| PumpError::Config(format!("invalid VPN exception '{pattern}': {e}")))
}

/// Allow/deny rules for publishing back into a VPN.
///
/// A matching pattern inverts the default action.
pub struct VpnExceptions {
    default_allow: Mutex<bool>,
    patterns: RwLock<Vec<(String, Regex)>>,
}

impl VpnExceptions {
    pub fn new(action: ExceptionAction) -> Self {
        Self { default_allow: Mutex::new(action == ExceptionAction::Allow), patterns: RwLock::new(Vec::new()) }
    }

    pub fn add(&self, pattern: &str) -> Result<()> {
        let regex = glob_to_regex(pattern)?;
        let mut patterns = self.patterns.write();
        if !patterns.iter().any(|(p, _)| p == pattern) {
            patterns.push((pattern.to_string(), regex));
        }
        Ok(())
    }

    pub fn set_default_action(&self, action: ExceptionAction) {
        let allow = action == ExceptionAction::Allow;
        let mut current = self.default_allow.lock();
        if *current != allow {
            info!("VPN exception default action changed to {:?}", action);
            *current = allow;
        }
    }

    pub fn default_action(&self) -> ExceptionAction {
        if *self.default_allow.lock() { ExceptionAction::Allow } else { ExceptionAction::Deny }
    }

    pub fn matches(&self, vpn: &str) -> bool {
        self.patterns.read().iter().any(|(_, regex)| regex.is_match(vpn))
    }

    pub fn is_allowed(&self, vpn: &str) -> bool {
        let default_allow = *self.default_allow.lock();
        default_allow ^ self.matches(vpn)
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns.read().iter().map(|(p, _)| p.clone()).collect()
    }
}

/// Consuming side of a bus queue, owned by the bus worker.
pub struct BusReceiver {
    rx: mpsc::Receiver<Arc<StatsMessage>>,
    stats: Arc<QueueStats>,
}

impl BusReceiver {
    pub async fn recv(&mut self) -> Option<Arc<StatsMessage>> {
        let msg = self.rx.recv().await?;
        self.stats.record_dequeue(self.rx.len());
        Some(msg)
    }

    pub fn try_recv(&mut self) -> Option<Arc<StatsMessage>> {
        let msg = self.rx.try_recv().ok()?;
        self.stats.record_dequeue(self.rx.len());
        Some(msg)
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

pub struct BusQueue {
    name: String,
    tx: mpsc::Sender<Arc<StatsMessage>>,
    rx: Mutex<Option<BusReceiver>>,
    stats: Arc<QueueStats>,
}

impl BusQueue {
    pub fn new(name: &str, capacity: usize, metrics: &QueueMetricsRegistry) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stats = metrics.register(name, capacity);
        Self {
            name: name.to_string(),
            tx,
            rx: Mutex::new(Some(BusReceiver { rx, stats: stats.clone() })),
            stats,
        }
    }

    fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Waits for room when the queue is full.
    pub async fn enqueue(&self, msg: Arc<StatsMessage>) -> Result<()> {
        let msg = match self.tx.try_send(msg) {
            Ok(()) => {
                self.stats.record_enqueue(self.depth());
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => return Err(PumpError::QueueClosed(self.name.clone())),
            Err(TrySendError::Full(msg)) => msg,
        };
        self.stats.record_blocked();
        debug!("Bus queue {} full, producer waiting", self.name);
        self.tx.send(msg).await.map_err(|_| PumpError::QueueClosed(self.name.clone()))?;
        self.stats.record_enqueue(self.depth());
        Ok(())
    }

    /// Blocking variant for the decoder thread. Must not run on an async worker.
    pub fn enqueue_blocking(&self, msg: Arc<StatsMessage>) -> Result<()> {
        let msg = match self.tx.try_send(msg) {
            Ok(()) => {
                self.stats.record_enqueue(self.depth());
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => return Err(PumpError::QueueClosed(self.name.clone())),
            Err(TrySendError::Full(msg)) => msg,
        };
        self.stats.record_blocked();
        debug!("Bus queue {} full, decoder waiting", self.name);
        self.tx.blocking_send(msg).map_err(|_| PumpError::QueueClosed(self.name.clone()))?;
        self.stats.record_enqueue(self.depth());
        Ok(())
    }

    /// Hands the consuming side to the bus worker; only the first call gets it.
    pub fn take_receiver(&self) -> Option<BusReceiver> {
        self.rx.lock().take()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.stats.snapshot()
    }
}

/// Identity used to share one bus between appliance definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusKey {
    pub host: String,
    pub vpn: Option<String>,
    pub encoding: EncodingKind,
}

/// Everything needed to build a bus.
#[derive(Clone)]
pub struct BusDefinition {
    pub kind: BusKind,
    pub host: String,
    pub vpn: Option<String>,
    pub username: String,
    pub password: String,
    pub encoding: EncodingKind,
    pub compressed: bool,
    pub grouped: bool,
    pub default_action: ExceptionAction,
    pub exceptions: Vec<String>,
    pub vpn_ports: HashMap<String, u16>,
    pub listener: Option<Arc<dyn LocalMgmtBusListener>>,
}

impl BusDefinition {
    pub fn new(kind: BusKind, host: impl Into<String>, vpn: Option<String>, encoding: EncodingKind) -> Self {
        Self {
            kind,
            host: host.into(),
            vpn,
            username: String::new(),
            password: String::new(),
            encoding,
            compressed: false,
            grouped: false,
            default_action: ExceptionAction::Allow,
            exceptions: Vec::new(),
            vpn_ports: HashMap::new(),
            listener: None,
        }
    }

    pub fn key(&self) -> BusKey {
        BusKey { host: self.host.to_ascii_lowercase(), vpn: self.vpn.clone(), encoding: self.encoding }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusSnapshot {
    pub name: String,
    pub kind: BusKind,
    pub host: String,
    pub vpn: Option<String>,
    pub encoding: EncodingKind,
    pub grouped: bool,
    pub virtual_router: String,
    pub default_action: ExceptionAction,
    pub exceptions: Vec<String>,
    pub queue: QueueSnapshot,
    pub connections: Vec<crate::connection::ConnectionSnapshot>,
}

pub struct MessageBus {
    pub name: String,
    pub kind: BusKind,
    pub host: String,
    /// Fixed VPN; `None` publishes back into the VPN a record came from.
    pub vpn: Option<String>,
    pub encoding: EncodingKind,
    pub compressed: bool,
    pub grouped: bool,
    pub listener: Option<Arc<dyn LocalMgmtBusListener>>,
    pub exceptions: VpnExceptions,
    pub connections: VpnConnectionManager,
    virtual_router: Mutex<String>,
    queue: BusQueue,
}

impl MessageBus {
    pub fn new(
        definition: BusDefinition,
        capacity: usize,
        metrics: &QueueMetricsRegistry,
        connector: Arc<dyn PubSubConnector>,
    ) -> Result<Self> {
        let name = format!(
            "{:?}:{}/{}/{}",
            definition.kind,
            definition.host,
            definition.vpn.as_deref().unwrap_or("*"),
            definition.encoding.key()
        )
        .to_lowercase();
        let exceptions = VpnExceptions::new(definition.default_action);
        for pattern in &definition.exceptions {
            exceptions.add(pattern)?;
        }
        Ok(Self {
            queue: BusQueue::new(&name, capacity, metrics),
            connections: VpnConnectionManager::new(
                &definition.host,
                definition.vpn.as_deref(),
                &definition.username,
                &definition.password,
                definition.vpn_ports.clone(),
                connector,
            ),
            name,
            kind: definition.kind,
            host: definition.host,
            vpn: definition.vpn,
            encoding: definition.encoding,
            compressed: definition.compressed,
            grouped: definition.grouped,
            listener: definition.listener,
            exceptions,
            virtual_router: Mutex::new(String::new()),
        })
    }

    pub fn is_local(&self) -> bool {
        self.kind == BusKind::Local
    }

    pub fn has_fixed_vpn(&self) -> bool {
        self.vpn.is_some()
    }

    pub fn queue(&self) -> &BusQueue {
        &self.queue
    }

    pub fn virtual_router_name(&self) -> String {
        self.virtual_router.lock().clone()
    }

    pub fn set_virtual_router_name(&self, name: &str) {
        let mut current = self.virtual_router.lock();
        if *current != name {
            info!("Bus {} now follows the {} virtual router", self.name, name);
            *current = name.to_string();
        }
    }

    pub fn snapshot(&self) -> BusSnapshot {
        BusSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            host: self.host.clone(),
            vpn: self.vpn.clone(),
            encoding: self.encoding,
            grouped: self.grouped,
            virtual_router: self.virtual_router_name(),
            default_action: self.exceptions.default_action(),
            exceptions: self.exceptions.patterns(),
            queue: self.queue.snapshot(),
            connections: self.connections.snapshot(),
        }
    }
}

/// Builds buses, handing back the existing instance for a known identity.
pub struct MessageBusRegistry {
    capacity: usize,
    metrics: QueueMetricsRegistry,
    connector: Arc<dyn PubSubConnector>,
    buses: Mutex<Vec<(BusKey, Arc<MessageBus>)>>,
}

impl MessageBusRegistry {
    pub fn new(capacity: usize, metrics: QueueMetricsRegistry, connector: Arc<dyn PubSubConnector>) -> Self {
        Self { capacity, metrics, connector, buses: Mutex::new(Vec::new()) }
    }

    pub fn get_or_create(&self, definition: BusDefinition) -> Result<Arc<MessageBus>> {
        let key = definition.key();
        let mut buses = self.buses.lock();
        if let Some((_, existing)) = buses.iter().find(|(k, _)| *k == key) {
            debug!("Reusing bus {} for {:?}", existing.name, key);
            for pattern in &definition.exceptions {
                existing.exceptions.add(pattern)?;
            }
            return Ok(existing.clone());
        }
        let bus = Arc::new(MessageBus::new(definition, self.capacity, &self.metrics, self.connector.clone())?);
        info!("Created bus {}", bus.name);
        buses.push((key, bus.clone()));
        Ok(bus)
    }

    pub fn all(&self) -> Vec<Arc<MessageBus>> {
        self.buses.lock().iter().map(|(_, bus)| bus.clone()).collect()
    }

    pub fn metrics(&self) -> &QueueMetricsRegistry {
        &self.metrics
    }
}
