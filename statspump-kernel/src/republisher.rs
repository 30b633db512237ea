/**
 * BUS WORKERS - one task per message bus draining its queue
 *
 * ROLE:
 * Pops messages in FIFO order, serializes them in the bus encoding, applies
 * the bus framing and publishes into every VPN the router resolves. Local
 * buses hand the wire message to their in-process listener instead.
 *
 * HOW IT WORKS:
 * - a failed publish is logged with its context and the worker moves on,
 *   nothing is retried
 * - a VPN whose connection is down is flagged and the message dropped
 * - on shutdown the queue is closed and what is left in it is drained
 */

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::bus::{BusReceiver, MessageBus};
use crate::health::PumpHealth;
use crate::message::{validate_topic, Framing, StatsMessage};
use crate::router::resolve_targets;

/// Framing shared by every bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishSettings {
    pub ttl_ms: u64,
    pub dmq_eligible: bool,
}

/// Starts the worker of `bus`. `None` when a worker already owns its queue.
pub fn spawn_bus_worker(
    bus: Arc<MessageBus>,
    settings: PublishSettings,
    health: PumpHealth,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let mut rx = bus.queue().take_receiver()?;
    Some(task::spawn(async move {
        debug!("Bus worker {} started", bus.name);
        loop {
            tokio::select! {
                next = rx.recv() => match next {
                    Some(msg) => {
                        publish_message(&bus, &settings, &health, &msg).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    drain(&bus, &settings, &health, &mut rx).await;
                    break;
                }
            }
        }
        debug!("Bus worker {} stopped", bus.name);
    }))
}

async fn drain(bus: &MessageBus, settings: &PublishSettings, health: &PumpHealth, rx: &mut BusReceiver) {
    rx.close();
    let mut drained = 0usize;
    while let Some(msg) = rx.recv().await {
        publish_message(bus, settings, health, &msg).await;
        drained += 1;
    }
    if drained > 0 {
        info!("Bus {} drained {} queued messages on shutdown", bus.name, drained);
    }
}

/// Publishes one message on one bus. Returns the number of successful sends.
pub async fn publish_message(
    bus: &MessageBus,
    settings: &PublishSettings,
    health: &PumpHealth,
    msg: &StatsMessage,
) -> usize {
    let virtual_router = bus.virtual_router_name();
    let framing = Framing {
        ttl_ms: settings.ttl_ms,
        dmq_eligible: settings.dmq_eligible,
        compressed: bus.compressed,
        virtual_router: (!virtual_router.is_empty()).then_some(virtual_router),
    };
    let wire = match msg.to_wire(bus.encoding, &framing) {
        Ok(wire) => wire,
        Err(e) => {
            warn!(
                "Bus {}: cannot serialize {} from {} (vpn {:?}): {}",
                bus.name, msg.poller.name, msg.router_name, msg.vpn, e
            );
            health.record_publish_failure();
            return 0;
        }
    };

    if bus.is_local() {
        return match &bus.listener {
            Some(listener) => {
                listener.on_mgmt_bus_stats(&wire);
                health.record_published();
                1
            }
            None => {
                warn!("Local bus {} has no listener, dropping {}", bus.name, wire.topic);
                health.record_publish_failure();
                0
            }
        };
    }

    if let Err(e) = validate_topic(&wire.topic) {
        warn!("Bus {}: {} from {} not published: {}", bus.name, msg.poller.name, msg.router_name, e);
        health.record_publish_failure();
        return 0;
    }

    let mut sent = 0;
    for vpn in resolve_targets(bus, msg) {
        let connection = match bus.connections.get_or_connect(&vpn) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Bus {}: no connection to VPN {} for {}: {}", bus.name, vpn, wire.topic, e);
                health.record_publish_failure();
                continue;
            }
        };
        if !connection.is_connected() {
            connection.set_requested_during_reconnection();
            debug!("Bus {}: VPN {} not connected, dropping {}", bus.name, vpn, wire.topic);
            continue;
        }
        match connection.publish(&wire).await {
            Ok(()) => {
                health.record_published();
                sent += 1;
            }
            Err(e) => {
                warn!(
                    "Bus {}: publish of {} ({} from {}) into VPN {} failed: {}",
                    bus.name, wire.topic, msg.poller.name, msg.router_name, vpn, e
                );
                health.record_publish_failure();
            }
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::VpnStatus;
    use crate::bus::{BusDefinition, BusKind};
    use crate::containers::{EncodingKind, WirePayload};
    use crate::local_bus::{CollectingListener, LocalMgmtBusListener};
    use crate::poller::{Destination, Poller};
    use crate::router::route;
    use crate::test_support::{bus_registry, logical_with, message_for, vpn_poller};
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    #[tokio::test]
    async fn worker_publishes_in_queue_order() {
        let (registry, broker) = bus_registry(8);
        let bus = registry
            .get_or_create(BusDefinition::new(BusKind::Mgmt, "broker", Some("mgmt".into()), EncodingKind::Json))
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let health = PumpHealth::new();
        let worker = spawn_bus_worker(bus.clone(), PublishSettings::default(), health.clone(), rx).unwrap();
        assert!(spawn_bus_worker(bus.clone(), PublishSettings::default(), health.clone(), tx.subscribe()).is_none());

        let poller = Arc::new(vpn_poller());
        for vpn in ["one", "two", "three"] {
            bus.queue().enqueue(message_for(&poller, vpn)).await.unwrap();
        }
        let published = statspump_devkit::wait_until(Duration::from_secs(2), || {
            let broker = broker.clone();
            async move { broker.published_on("broker", "mgmt").len() == 3 }
        })
        .await;
        assert!(published);

        let topics: Vec<String> = broker.published_on("broker", "mgmt").into_iter().map(|m| m.topic).collect();
        assert!(topics[0].contains("/one/"));
        assert!(topics[1].contains("/two/"));
        assert!(topics[2].contains("/three/"));

        tx.send(true).unwrap();
        worker.await.unwrap();
        assert_eq!(health.messages_published(), 3);
    }

    #[tokio::test]
    async fn disconnected_vpn_is_flagged_and_skipped() {
        let (registry, broker) = bus_registry(8);
        let bus = registry
            .get_or_create(BusDefinition::new(BusKind::Mgmt, "broker", Some("mgmt".into()), EncodingKind::Json))
            .unwrap();
        broker.client_for("broker", "mgmt").set_connected(false);

        let msg = message_for(&Arc::new(vpn_poller()), "v");
        let sent = publish_message(&bus, &PublishSettings::default(), &PumpHealth::new(), &msg).await;
        assert_eq!(sent, 0);
        assert!(bus.connections.get("mgmt").unwrap().was_requested_during_reconnection());
        assert!(broker.published_on("broker", "mgmt").is_empty());
    }

    #[tokio::test]
    async fn invalid_topic_is_a_logged_failure() {
        let (registry, broker) = bus_registry(8);
        let bus = registry
            .get_or_create(BusDefinition::new(BusKind::Mgmt, "broker", Some("mgmt".into()), EncodingKind::Json))
            .unwrap();
        let health = PumpHealth::new();
        // a missing VPN tag leaves an empty topic level
        let msg = message_for(&Arc::new(vpn_poller()), "");
        assert_eq!(publish_message(&bus, &PublishSettings::default(), &health, &msg).await, 0);
        assert_eq!(health.publish_failures(), 1);
        assert_eq!(broker.total_published(), 0);
    }

    #[tokio::test]
    async fn local_bus_delivers_in_process() {
        let (registry, broker) = bus_registry(8);
        let collector = Arc::new(CollectingListener::new());
        let bus = registry
            .get_or_create(BusDefinition {
                listener: Some(collector.clone() as Arc<dyn LocalMgmtBusListener>),
                ..BusDefinition::new(BusKind::Local, "local:collect", None, EncodingKind::Json)
            })
            .unwrap();
        let settings = PublishSettings { ttl_ms: 1000, dmq_eligible: true };
        let msg = message_for(&Arc::new(vpn_poller()), "v");
        assert_eq!(publish_message(&bus, &settings, &PumpHealth::new(), &msg).await, 1);

        let received = collector.messages();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].ttl_ms, 1000);
        assert!(received[0].dmq_eligible);
        assert_eq!(broker.total_published(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_messages() {
        let (registry, broker) = bus_registry(8);
        let bus = registry
            .get_or_create(BusDefinition::new(BusKind::Mgmt, "broker", Some("mgmt".into()), EncodingKind::Json))
            .unwrap();
        let poller = Arc::new(vpn_poller());
        for vpn in ["a", "b"] {
            bus.queue().enqueue(message_for(&poller, vpn)).await.unwrap();
        }
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let worker = spawn_bus_worker(bus.clone(), PublishSettings::default(), PumpHealth::new(), rx).unwrap();
        worker.await.unwrap();
        assert_eq!(broker.published_on("broker", "mgmt").len(), 2);
    }

    #[tokio::test]
    async fn reserved_vpn_records_reach_the_management_bus() {
        let (registry, broker) = bus_registry(8);
        let bus = registry
            .get_or_create(BusDefinition::new(BusKind::Mgmt, "broker", Some("mgmt".into()), EncodingKind::Json))
            .unwrap();
        let health = PumpHealth::new();
        let poller = Arc::new(vpn_poller());
        for vpn in ["default", "#config-sync"] {
            let sent = publish_message(&bus, &PublishSettings::default(), &health, &message_for(&poller, vpn)).await;
            assert_eq!(sent, 1, "{vpn} not published");
        }

        let published = broker.published_on("broker", "mgmt");
        assert_eq!(published.len(), 2);
        assert!(published[1].topic.contains("/%23config-sync/"));
        assert_eq!(published[1].user_property("vpn"), Some("#config-sync"));
        assert_eq!(health.publish_failures(), 0);
    }

    /// BOTH destination, no VPN: the fixed-VPN self bus gets it once, the
    /// origin-VPN self bus once per enabled VPN except the one the
    /// management bus already reaches.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn appliance_wide_message_through_bus_workers() {
        let (registry, broker) = bus_registry(8);
        let mgmt = registry
            .get_or_create(BusDefinition::new(BusKind::Mgmt, "broker", Some("mgmt".into()), EncodingKind::Json))
            .unwrap();
        let fixed = registry
            .get_or_create(BusDefinition::new(BusKind::SelfVpn, "broker", Some("collector".into()), EncodingKind::Json))
            .unwrap();
        let origin = registry
            .get_or_create(BusDefinition {
                vpn_ports: HashMap::from([("mgmt".to_string(), 1884), ("a".to_string(), 1885), ("b".to_string(), 1886)]),
                ..BusDefinition::new(BusKind::SelfVpn, "broker", None, EncodingKind::Json)
            })
            .unwrap();
        let logical = logical_with(vec![mgmt.clone()], vec![], vec![fixed.clone(), origin.clone()]);
        let active = VpnStatus { enabled: true, operational: true, ..Default::default() };
        for vpn in ["mgmt", "a", "b", "#config-sync"] {
            logical.primary.update_vpn(vpn, active.clone());
        }
        logical.primary.update_vpn("down", VpnStatus { enabled: false, ..active });

        let (tx, rx) = watch::channel(false);
        let health = PumpHealth::new();
        let workers: Vec<_> = [&mgmt, &fixed, &origin]
            .into_iter()
            .map(|bus| spawn_bus_worker(bus.clone(), PublishSettings::default(), health.clone(), rx.clone()).unwrap())
            .collect();

        let poller = Arc::new(
            Poller::builder("Broadcast")
                .request("<rpc/>")
                .base_path("/rpc-reply/rpc/show/x")
                .destination(Destination::Both)
                .build()
                .unwrap(),
        );
        let payloads = BTreeMap::from([(EncodingKind::Json, WirePayload::Json(serde_json::json!({ "up": true })))]);
        let msg = Arc::new(StatsMessage::new(poller, logical.clone(), logical.primary.clone(), BTreeMap::new(), payloads));
        assert_eq!(route(&msg).await.unwrap(), 3);

        let delivered = statspump_devkit::wait_until(Duration::from_secs(2), || {
            let broker = broker.clone();
            async move { broker.total_published() >= 4 }
        })
        .await;
        assert!(delivered);
        tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap();
        }

        for vpn in ["mgmt", "collector", "a", "b"] {
            assert_eq!(broker.published_on("broker", vpn).len(), 1, "VPN {vpn}");
        }
        for vpn in ["#config-sync", "down"] {
            assert!(broker.published_on("broker", vpn).is_empty(), "VPN {vpn}");
        }
        assert_eq!(broker.total_published(), 4);
        assert_eq!(health.publish_failures(), 0);
    }
}
