/**
 * STATSPUMP KERNEL - SEMP statistics pump
 *
 * ROLE: Polls message-broker appliances over SEMP (XML over HTTP), turns each
 * reply into per-object records in every encoding the buses need, and
 * republishes them on management, self-VPN and in-process buses.
 *
 * ARCHITECTURE: config -> pump (appliances, pollers, buses) -> scheduler
 * (poll cycles, decoder) -> router -> bus queues -> republisher workers.
 */

pub mod appliance;
pub mod bus;
pub mod config;
pub mod connection;
pub mod containers;
pub mod decoder;
pub mod error;
pub mod health;
pub mod http;
pub mod local_bus;
pub mod message;
pub mod metrics;
pub mod poller;
pub mod pump;
pub mod republisher;
pub mod router;
pub mod scheduler;
pub mod schema;
pub mod semp;
pub mod state;

pub use error::{PumpError, Result};
pub use pump::StatsPump;

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use statspump_devkit::MockBroker;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;

    use crate::appliance::{Credentials, LogicalAppliance, PhysicalAppliance, RedundancyType, Role};
    use crate::bus::{MessageBus, MessageBusRegistry};
    use crate::containers::{EncodingKind, WirePayload};
    use crate::error::{PumpError, Result};
    use crate::message::StatsMessage;
    use crate::metrics::QueueMetricsRegistry;
    use crate::poller::{Destination, Poller, Scope, VPN_NAME_TAG};
    use crate::semp::SempTransport;

    fn node(host: &str, role: Role) -> Arc<PhysicalAppliance> {
        let credentials = Credentials { username: "admin".into(), password: "admin".into() };
        Arc::new(PhysicalAppliance::new(host, credentials, role, false))
    }

    pub fn logical_with(
        mgmt: Vec<Arc<MessageBus>>,
        local: Vec<Arc<MessageBus>>,
        self_buses: Vec<Arc<MessageBus>>,
    ) -> Arc<LogicalAppliance> {
        Arc::new(LogicalAppliance {
            name: "lab".into(),
            redundancy: RedundancyType::Standalone,
            primary: node("10.0.0.1:8080", Role::Primary),
            backup: None,
            pollers: Vec::new(),
            mgmt_buses: mgmt,
            local_buses: local,
            self_buses,
        })
    }

    pub fn logical_pair(mgmt: Vec<Arc<MessageBus>>, redundancy: RedundancyType) -> Arc<LogicalAppliance> {
        Arc::new(LogicalAppliance {
            name: "pair".into(),
            redundancy,
            primary: node("10.0.0.1:8080", Role::Primary),
            backup: Some(node("10.0.0.2:8080", Role::Backup)),
            pollers: Vec::new(),
            mgmt_buses: mgmt,
            local_buses: Vec::new(),
            self_buses: Vec::new(),
        })
    }

    pub fn vpn_poller() -> Poller {
        Poller::builder("VpnStats")
            .scope(Scope::Vpn)
            .destination(Destination::Both)
            .request("<rpc><show><message-vpn><vpn-name>*</vpn-name></message-vpn></show></rpc>")
            .base_path("/rpc-reply/rpc/show/message-vpn/vpn")
            .vpn_name_path("/name")
            .topic_suffix("DETAIL")
            .build()
            .expect("valid test poller")
    }

    pub fn bus_registry(capacity: usize) -> (MessageBusRegistry, MockBroker) {
        let broker = MockBroker::new();
        let registry = MessageBusRegistry::new(capacity, QueueMetricsRegistry::new(), Arc::new(broker.clone()));
        (registry, broker)
    }

    pub fn message_for(poller: &Arc<Poller>, vpn: &str) -> Arc<StatsMessage> {
        let logical = logical_with(vec![], vec![], vec![]);
        let tags = BTreeMap::from([(VPN_NAME_TAG.to_string(), vpn.to_string())]);
        let payloads = BTreeMap::from([(EncodingKind::Json, WirePayload::Json(serde_json::json!({ "name": vpn })))]);
        Arc::new(StatsMessage::new(poller.clone(), logical.clone(), logical.primary.clone(), tags, payloads))
    }

    /// Replays queued replies in order and records every request.
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<Bytes>>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, reply: String) {
            self.replies.lock().push_back(Ok(Bytes::from(reply)));
        }

        pub fn push_unreachable(&self) {
            self.replies
                .lock()
                .push_back(Err(PumpError::Unreachable("connection refused".into())));
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl SempTransport for ScriptedTransport {
        async fn post(&self, node: &PhysicalAppliance, request: &str) -> Result<Bytes> {
            self.requests.lock().push(request.to_string());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(PumpError::SempReply(format!("no scripted reply for {}", node.host))))
        }
    }
}
