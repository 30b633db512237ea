/**
 * STATS PUMP - assembly and lifecycle
 *
 * ROLE:
 * Turns a validated configuration into logical appliances, shared message
 * buses and poll tasks, then starts and stops them as one unit.
 *
 * HOW IT WORKS:
 * - pollers are built once and shared by every appliance that uses them
 * - buses go through the registry, so identical definitions share a queue
 * - start: listener startup hooks, bus workers, schedulers, queue reporter
 * - stop: signal everything, let bus workers drain (bounded), then run the
 *   listener shutdown hooks and close broker connections
 */

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::appliance::{LogicalAppliance, PhysicalAppliance, Role, ScheduledPoller};
use crate::bus::{BusKind, BusDefinition, MessageBus, MessageBusRegistry};
use crate::config::{ApplianceConf, BusConf, PumpConfig, PumpSettings};
use crate::connection::PubSubConnector;
use crate::containers::EncodingKind;
use crate::error::{PumpError, Result};
use crate::health::{spawn_queue_reporter, PumpHealth};
use crate::http::StatusState;
use crate::local_bus::{ListenerRegistry, LocalMgmtBusListener};
use crate::metrics::QueueMetricsRegistry;
use crate::poller::Poller;
use crate::republisher::{spawn_bus_worker, PublishSettings};
use crate::scheduler::{spawn_appliance, PollContext, PollTracker};
use crate::schema::SchemaRegistry;
use crate::semp::SempTransport;

pub struct StatsPump {
    settings: PumpSettings,
    appliances: Arc<Vec<Arc<LogicalAppliance>>>,
    buses: Arc<MessageBusRegistry>,
    ctx: PollContext,
    shutdown: watch::Sender<bool>,
    schedulers: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StatsPump {
    pub fn from_config(
        config: &PumpConfig,
        listeners: &ListenerRegistry,
        transport: Arc<dyn SempTransport>,
        connector: Arc<dyn PubSubConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let settings = config.pump.clone();

        let schema = match &settings.schema_file {
            Some(path) => SchemaRegistry::load(path)?,
            None => SchemaRegistry::with_builtins(),
        };
        info!("Schema registry holds {} element types", schema.len());

        let mut pollers: BTreeMap<String, Arc<Poller>> = BTreeMap::new();
        for conf in &config.pollers {
            pollers.insert(conf.name.clone(), Arc::new(conf.to_poller(&settings.topic_prefix)?));
        }

        let metrics = QueueMetricsRegistry::new();
        let buses = Arc::new(MessageBusRegistry::new(settings.queue_capacity, metrics, connector));
        let builtins = builtin_pollers(&settings);

        let mut appliances = Vec::new();
        for conf in &config.appliances {
            let logical = build_appliance(config, conf, &pollers, &builtins, &buses, listeners)?;
            info!(
                "Appliance {} ({:?}): {} nodes, {} pollers, {} buses",
                logical.name,
                logical.redundancy,
                logical.nodes().len(),
                logical.pollers.len(),
                logical.all_buses().len()
            );
            appliances.push(Arc::new(logical));
        }

        let ctx = PollContext {
            transport,
            schema: Arc::new(schema),
            health: PumpHealth::new(),
            polls: PollTracker::new(),
        };
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            settings,
            appliances: Arc::new(appliances),
            buses,
            ctx,
            shutdown,
            schedulers: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn appliances(&self) -> &[Arc<LogicalAppliance>] {
        &self.appliances
    }

    pub fn buses(&self) -> Vec<Arc<MessageBus>> {
        self.buses.all()
    }

    pub fn health(&self) -> &PumpHealth {
        &self.ctx.health
    }

    fn listeners(&self) -> Vec<Arc<dyn LocalMgmtBusListener>> {
        let mut unique: Vec<Arc<dyn LocalMgmtBusListener>> = Vec::new();
        for bus in self.buses.all() {
            if let Some(listener) = &bus.listener {
                if !unique.iter().any(|known| Arc::ptr_eq(known, listener)) {
                    unique.push(listener.clone());
                }
            }
        }
        unique
    }

    pub async fn start(&self) -> Result<()> {
        for listener in self.listeners() {
            listener.on_pump_startup()?;
        }

        let publish = PublishSettings {
            ttl_ms: self.settings.publish_ttl_ms,
            dmq_eligible: self.settings.publish_dmq_eligible,
        };
        let mut workers = self.workers.lock();
        for bus in self.buses.all() {
            if let (false, Some(vpn)) = (bus.is_local(), &bus.vpn) {
                if let Err(e) = bus.connections.get_or_connect(vpn) {
                    warn!("Bus {}: initial connection to {} failed: {}", bus.name, vpn, e);
                }
            }
            if let Some(worker) =
                spawn_bus_worker(bus.clone(), publish, self.ctx.health.clone(), self.shutdown.subscribe())
            {
                workers.push(worker);
            }
        }
        drop(workers);

        let mut schedulers = self.schedulers.lock();
        for logical in self.appliances.iter() {
            schedulers.extend(spawn_appliance(
                &self.ctx,
                logical,
                self.settings.reachability_retry(),
                &self.shutdown.subscribe(),
            ));
        }
        schedulers.push(spawn_queue_reporter(
            self.buses.metrics().clone(),
            self.settings.queue_report_interval(),
            self.shutdown.subscribe(),
        ));
        info!("Stats pump started: {} appliances, {} buses", self.appliances.len(), self.buses.all().len());
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping stats pump");
        let _ = self.shutdown.send(true);

        // In-flight polls finish on their own; only the bus drain is awaited.
        let schedulers: Vec<JoinHandle<()>> = self.schedulers.lock().drain(..).collect();
        drop(schedulers);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let drain = futures::future::join_all(workers);
        if tokio::time::timeout(self.settings.drain_timeout(), drain).await.is_err() {
            warn!("Bus workers did not drain within {:?}", self.settings.drain_timeout());
        }

        for listener in self.listeners() {
            listener.on_pump_shutdown();
        }
        for bus in self.buses.all() {
            bus.connections.disconnect_all().await;
        }
        info!("Stats pump stopped");
    }

    pub fn status_state(&self, api_key: Option<String>) -> StatusState {
        StatusState {
            appliances: self.appliances.clone(),
            buses: self.buses.clone(),
            health: self.ctx.health.clone(),
            polls: self.ctx.polls.clone(),
            api_key,
        }
    }
}

fn builtin_pollers(settings: &PumpSettings) -> Vec<ScheduledPoller> {
    let intervals = settings.builtin_intervals;
    [
        (Poller::hostname(), intervals.hostname),
        (Poller::redundancy(), intervals.redundancy),
        (Poller::message_spool(), intervals.message_spool),
        (Poller::vpn_detail(), intervals.vpn_detail),
    ]
    .into_iter()
    .map(|(poller, secs)| ScheduledPoller {
        poller: Arc::new(poller.with_topic_prefix(&settings.topic_prefix)),
        interval: Duration::from_secs(secs.max(1)),
    })
    .collect()
}

fn node(conf: &crate::config::NodeConf, role: Role) -> Result<Arc<PhysicalAppliance>> {
    Ok(Arc::new(PhysicalAppliance::new(&conf.host, conf.credentials()?, role, conf.secure)))
}

fn bus_definition(kind: BusKind, conf: &BusConf) -> Result<BusDefinition> {
    Ok(BusDefinition {
        username: conf.username.clone(),
        password: conf.password()?,
        compressed: conf.compressed,
        grouped: conf.grouped,
        default_action: conf.default_action,
        exceptions: conf.exceptions.clone(),
        vpn_ports: conf.vpn_ports.clone(),
        ..BusDefinition::new(kind, &conf.host, conf.vpn.clone(), conf.encoding()?)
    })
}

fn build_appliance(
    config: &PumpConfig,
    conf: &ApplianceConf,
    pollers: &BTreeMap<String, Arc<Poller>>,
    builtins: &[ScheduledPoller],
    buses: &MessageBusRegistry,
    listeners: &ListenerRegistry,
) -> Result<LogicalAppliance> {
    let mut scheduled: Vec<ScheduledPoller> = builtins.to_vec();
    for group_name in &conf.poller_groups {
        let group = config
            .group(group_name)
            .ok_or_else(|| PumpError::Config(format!("unknown poller group {group_name}")))?;
        for member in &group.pollers {
            let poller = pollers
                .get(&member.poller)
                .ok_or_else(|| PumpError::Config(format!("unknown poller {}", member.poller)))?;
            if scheduled.iter().any(|s| s.poller.name == poller.name) {
                warn!("Appliance {}: poller {} listed twice, keeping the first", conf.name, poller.name);
                continue;
            }
            scheduled.push(ScheduledPoller { poller: poller.clone(), interval: Duration::from_secs(member.interval_secs) });
        }
    }

    let mgmt_buses = conf
        .mgmt_buses
        .iter()
        .map(|b| buses.get_or_create(bus_definition(BusKind::Mgmt, b)?))
        .collect::<Result<Vec<_>>>()?;
    let self_buses = conf
        .self_buses
        .iter()
        .map(|b| buses.get_or_create(bus_definition(BusKind::SelfVpn, b)?))
        .collect::<Result<Vec<_>>>()?;
    let local_buses = conf
        .local_buses
        .iter()
        .map(|local| {
            let listener = listeners.create(&local.listener, &local.options)?;
            let encoding = EncodingKind::from_key(&local.encoding)?;
            buses.get_or_create(BusDefinition {
                grouped: local.grouped,
                listener: Some(listener),
                ..BusDefinition::new(BusKind::Local, format!("local:{}", local.listener), None, encoding)
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(LogicalAppliance {
        name: conf.name.clone(),
        redundancy: conf.redundancy,
        primary: node(&conf.primary, Role::Primary)?,
        backup: conf.backup.as_ref().map(|b| node(b, Role::Backup)).transpose()?,
        pollers: scheduled,
        mgmt_buses,
        local_buses,
        self_buses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::VpnStatus;
    use crate::config::parse_config;
    use crate::local_bus::CollectingListener;
    use crate::test_support::ScriptedTransport;
    use statspump_devkit::{wait_until, MockBroker, SempReplyBuilder, TestHarness};

    const CONFIG: &str = r#"
pump:
  queue_capacity: 16
  reachability_retry_secs: 1
  drain_timeout_secs: 2
  builtin_intervals: { hostname: 3600, redundancy: 3600, message_spool: 3600, vpn_detail: 3600 }
appliances:
  - name: lab
    primary: { host: "semp-host:8080", username: admin, password: admin }
    mgmt_buses:
      - host: broker
        vpn: mgmt
    self_buses:
      - host: broker
        vpn: collector
      - host: broker
        exceptions: [guest]
        vpn_ports: { alpha: 1884, beta: 1885, guest: 1886, off: 1887 }
    local_buses:
      - listener: collect
"#;

    fn pump(transport: Arc<ScriptedTransport>, broker: &MockBroker) -> (StatsPump, Arc<CollectingListener>) {
        let collector = Arc::new(CollectingListener::new());
        let mut listeners = ListenerRegistry::with_builtins();
        listeners.register_instance("collect", collector.clone());
        let config = parse_config(CONFIG).unwrap();
        let pump = StatsPump::from_config(&config, &listeners, transport, Arc::new(broker.clone())).unwrap();
        (pump, collector)
    }

    #[test]
    fn builds_appliances_with_builtins_and_shared_buses() {
        let broker = MockBroker::new();
        let (pump, _) = pump(Arc::new(ScriptedTransport::new()), &broker);
        let lab = &pump.appliances()[0];
        let names: Vec<&str> = lab.pollers.iter().map(|p| p.poller.name.as_str()).collect();
        assert_eq!(names, vec!["HostnamePoller", "RedundancyPoller", "MessageSpoolPoller", "VpnDetailPoller"]);
        assert_eq!(lab.mgmt_buses.len(), 1);
        assert_eq!(lab.self_buses.len(), 2);
        assert_eq!(pump.buses().len(), 4);
    }

    #[test]
    fn unknown_listener_is_a_config_error() {
        let config = parse_config(CONFIG).unwrap();
        let result = StatsPump::from_config(
            &config,
            &ListenerRegistry::with_builtins(),
            Arc::new(ScriptedTransport::new()),
            Arc::new(MockBroker::new()),
        );
        assert!(matches!(result, Err(PumpError::UnknownListener(_))));
    }

    /// BOTH destination, appliance-wide message: once on the fixed-VPN self
    /// bus, once per active non-excepted VPN, never into the VPN the
    /// management bus already covers.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn appliance_wide_message_fans_out_end_to_end() {
        let harness = TestHarness::new();
        let transport = Arc::new(ScriptedTransport::new());
        let (pump, collector) = pump(transport.clone(), &harness.broker);
        let lab = pump.appliances()[0].clone();
        let active = VpnStatus { enabled: true, operational: true, ..Default::default() };
        for vpn in ["mgmt", "alpha", "beta", "guest", "#internal"] {
            lab.primary.update_vpn(vpn, active.clone());
        }
        lab.primary.update_vpn("off", VpnStatus { enabled: false, ..active.clone() });

        pump.start().await.unwrap();
        assert!(collector.started());

        let poller = Arc::new(
            Poller::builder("Broadcast")
                .request("<rpc/>")
                .base_path("/rpc-reply/rpc/show/x")
                .destination(crate::poller::Destination::Both)
                .build()
                .unwrap(),
        );
        let payloads = BTreeMap::from([(
            EncodingKind::Json,
            crate::containers::WirePayload::Json(serde_json::json!({ "up": true })),
        )]);
        let msg = Arc::new(crate::message::StatsMessage::new(
            poller,
            lab.clone(),
            lab.primary.clone(),
            BTreeMap::new(),
            payloads,
        ));
        assert_eq!(crate::router::route(&msg).await.unwrap(), 4);

        for vpn in ["collector", "mgmt", "alpha", "beta"] {
            assert!(harness.wait_for_messages("broker", vpn, 1).await, "nothing reached {vpn}");
            harness.assert_topic_published("broker", vpn, "STATS/SYSTEM/semp-host:8080/BROADCAST");
        }
        for vpn in ["guest", "#internal", "off"] {
            harness.assert_nothing_on("broker", vpn);
        }
        assert_eq!(harness.broker.total_published(), 4);
        let delivered = wait_until(Duration::from_secs(2), || {
            let collector = collector.clone();
            async move { collector.messages().len() == 1 }
        })
        .await;
        assert!(delivered);

        pump.stop().await;
        assert!(collector.stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn probe_bootstraps_the_primary() {
        let broker = MockBroker::new();
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(SempReplyBuilder::hostname("soltr/9_0", "router-lab"));
        transport.push(SempReplyBuilder::redundancy("soltr/9_0", "Shutdown", "Local Active", "Shutdown"));
        transport.push(SempReplyBuilder::message_spool("soltr/9_0", "AD-Active"));
        let (pump, _) = pump(transport.clone(), &broker);
        let lab = pump.appliances()[0].clone();

        pump.start().await.unwrap();
        let reachable = wait_until(Duration::from_secs(3), || {
            let node = lab.primary.clone();
            async move { node.is_reachable() }
        })
        .await;
        assert!(reachable);
        assert_eq!(lab.primary.router_name(), "router-lab");
        assert!(transport.requests().len() >= 3);
        pump.stop().await;
    }
}
