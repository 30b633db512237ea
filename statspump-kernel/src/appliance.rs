/**
 * APPLIANCES - physical node state and logical redundancy groups
 *
 * ROLE:
 * A PhysicalAppliance is one broker node: credentials, reachability, the
 * activity of its primary/backup virtual routers and the status of every
 * message VPN it hosts. A LogicalAppliance pairs one or two nodes and owns
 * the pollers and message buses configured for them.
 *
 * The state is written by the built-in pollers (hostname, redundancy, VPN
 * detail) and read by run-conditions and the router.
 */

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::containers::EncodingKind;
use crate::message::format_timestamp;
use crate::poller::{Destination, Poller, RunCondition};

pub const LOCAL_ACTIVE: &str = "Local Active";
pub const DEFAULT_SEMP_VERSION: &str = "soltr/7_1";
pub const UNINITIALIZED: &str = "UNINITIALIZED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedundancyType {
    Standalone,
    ActiveStandby,
    ActiveActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Backup,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Backup => "backup",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VpnStatus {
    pub enabled: bool,
    pub operational: bool,
    pub locally_configured: bool,
    pub local_status: String,
}

impl VpnStatus {
    pub fn is_active(&self) -> bool {
        self.enabled && self.operational
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
struct NodeState {
    reachable: bool,
    router_name: Option<String>,
    semp_version: String,
    redundancy_mode: String,
    primary_activity: String,
    backup_activity: String,
    ad_status: String,
    vpns: BTreeMap<String, VpnStatus>,
    last_change: Option<OffsetDateTime>,
}

/// Read-only view for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub host: String,
    pub role: Role,
    pub reachable: bool,
    pub router_name: String,
    pub semp_version: String,
    pub redundancy_mode: String,
    pub primary_activity: String,
    pub backup_activity: String,
    pub ad_status: String,
    pub active_vpns: usize,
    pub known_vpns: usize,
    pub last_change: Option<String>,
}

#[derive(Debug)]
pub struct PhysicalAppliance {
    pub host: String,
    pub secure: bool,
    pub credentials: Credentials,
    pub role: Role,
    state: RwLock<NodeState>,
}

impl PhysicalAppliance {
    pub fn new(host: impl Into<String>, credentials: Credentials, role: Role, secure: bool) -> Self {
        Self {
            host: host.into(),
            secure,
            credentials,
            role,
            state: RwLock::new(NodeState {
                reachable: false,
                router_name: None,
                semp_version: DEFAULT_SEMP_VERSION.to_string(),
                redundancy_mode: UNINITIALIZED.to_string(),
                primary_activity: UNINITIALIZED.to_string(),
                backup_activity: UNINITIALIZED.to_string(),
                ad_status: UNINITIALIZED.to_string(),
                vpns: BTreeMap::new(),
                last_change: None,
            }),
        }
    }

    pub fn semp_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}/SEMP", self.host)
    }

    pub fn is_reachable(&self) -> bool {
        self.state.read().reachable
    }

    pub fn declare_reachable(&self) {
        let mut state = self.state.write();
        if !state.reachable {
            state.reachable = true;
            state.last_change = Some(OffsetDateTime::now_utc());
            info!("Appliance {} ({}) is reachable", self.host, self.role.as_str());
        }
    }

    pub fn declare_unreachable(&self) {
        let mut state = self.state.write();
        if state.reachable {
            state.reachable = false;
            state.last_change = Some(OffsetDateTime::now_utc());
            warn!("Appliance {} ({}) is no longer reachable", self.host, self.role.as_str());
        }
    }

    /// Reported hostname, or the configured host until the first reply.
    pub fn router_name(&self) -> String {
        self.state.read().router_name.clone().unwrap_or_else(|| self.host.clone())
    }

    pub fn set_router_name(&self, name: &str) {
        let mut state = self.state.write();
        if state.router_name.as_deref() != Some(name) {
            info!("Appliance {} reports router name {}", self.host, name);
            state.router_name = Some(name.to_string());
        }
    }

    pub fn semp_version(&self) -> String {
        self.state.read().semp_version.clone()
    }

    pub fn set_semp_version(&self, version: &str) {
        let mut state = self.state.write();
        if state.semp_version != version {
            info!("Appliance {} speaks SEMP {}", self.host, version);
            state.semp_version = version.to_string();
        }
    }

    pub fn redundancy_mode(&self) -> String {
        self.state.read().redundancy_mode.clone()
    }

    pub fn set_redundancy_mode(&self, mode: &str) {
        self.state.write().redundancy_mode = mode.to_string();
    }

    /// Records the activity of both virtual routers. Returns true on change.
    pub fn update_activity(&self, primary: &str, backup: &str) -> bool {
        let mut state = self.state.write();
        let changed = state.primary_activity != primary || state.backup_activity != backup;
        if changed {
            info!(
                "Appliance {} activity: primary '{}' -> '{}', backup '{}' -> '{}'",
                self.host, state.primary_activity, primary, state.backup_activity, backup
            );
            state.primary_activity = primary.to_string();
            state.backup_activity = backup.to_string();
            state.last_change = Some(OffsetDateTime::now_utc());
        }
        changed
    }

    pub fn primary_local_active(&self) -> bool {
        self.state.read().primary_activity == LOCAL_ACTIVE
    }

    pub fn backup_local_active(&self) -> bool {
        self.state.read().backup_activity == LOCAL_ACTIVE
    }

    pub fn set_ad_status(&self, status: &str) {
        self.state.write().ad_status = status.to_string();
    }

    pub fn ad_status(&self) -> String {
        self.state.read().ad_status.clone()
    }

    pub fn update_vpn(&self, name: &str, status: VpnStatus) {
        let mut state = self.state.write();
        let was_active = state.vpns.get(name).map(VpnStatus::is_active);
        if was_active != Some(status.is_active()) {
            info!("VPN {} on {} is now {}", name, self.host, if status.is_active() { "active" } else { "inactive" });
        }
        state.vpns.insert(name.to_string(), status);
    }

    pub fn vpn_status(&self, name: &str) -> Option<VpnStatus> {
        self.state.read().vpns.get(name).cloned()
    }

    pub fn is_active_vpn(&self, name: &str) -> bool {
        self.state.read().vpns.get(name).is_some_and(VpnStatus::is_active)
    }

    pub fn active_vpns(&self) -> Vec<String> {
        self.state
            .read()
            .vpns
            .iter()
            .filter(|(_, status)| status.is_active())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether this node is the one currently serving traffic.
    pub fn is_currently_active(&self, redundancy: RedundancyType) -> bool {
        match redundancy {
            RedundancyType::Standalone => true,
            RedundancyType::ActiveActive => self.primary_local_active(),
            RedundancyType::ActiveStandby => match self.role {
                Role::Primary => self.primary_local_active(),
                Role::Backup => self.backup_local_active(),
            },
        }
    }

    /// Picks the run-condition for this node's role and evaluates it.
    pub fn should_run(&self, poller: &Poller, redundancy: RedundancyType) -> bool {
        let condition = match (redundancy, self.role) {
            (RedundancyType::Standalone, _) => {
                return match poller.run.primary_active_standby {
                    RunCondition::Always | RunCondition::PrimaryLocalActive => true,
                    RunCondition::Never | RunCondition::BackupLocalActive => false,
                };
            }
            (RedundancyType::ActiveStandby, Role::Primary) => poller.run.primary_active_standby,
            (RedundancyType::ActiveStandby, Role::Backup) => poller.run.backup_active_standby,
            (RedundancyType::ActiveActive, Role::Primary) => poller.run.primary_active_active,
            (RedundancyType::ActiveActive, Role::Backup) => poller.run.backup_active_active,
        };
        condition.evaluate(self)
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot {
            host: self.host.clone(),
            role: self.role,
            reachable: state.reachable,
            router_name: state.router_name.clone().unwrap_or_else(|| self.host.clone()),
            semp_version: state.semp_version.clone(),
            redundancy_mode: state.redundancy_mode.clone(),
            primary_activity: state.primary_activity.clone(),
            backup_activity: state.backup_activity.clone(),
            ad_status: state.ad_status.clone(),
            active_vpns: state.vpns.values().filter(|v| v.is_active()).count(),
            known_vpns: state.vpns.len(),
            last_change: state.last_change.map(format_timestamp),
        }
    }
}

impl RunCondition {
    pub fn evaluate(&self, node: &PhysicalAppliance) -> bool {
        match self {
            RunCondition::Always => true,
            RunCondition::Never => false,
            RunCondition::PrimaryLocalActive => node.primary_local_active(),
            RunCondition::BackupLocalActive => node.backup_local_active(),
        }
    }
}

/// A poller assigned to a logical appliance with its interval.
#[derive(Debug, Clone)]
pub struct ScheduledPoller {
    pub poller: Arc<Poller>,
    pub interval: Duration,
}

pub struct LogicalAppliance {
    pub name: String,
    pub redundancy: RedundancyType,
    pub primary: Arc<PhysicalAppliance>,
    pub backup: Option<Arc<PhysicalAppliance>>,
    pub pollers: Vec<ScheduledPoller>,
    pub mgmt_buses: Vec<Arc<MessageBus>>,
    pub local_buses: Vec<Arc<MessageBus>>,
    pub self_buses: Vec<Arc<MessageBus>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplianceSnapshot {
    pub name: String,
    pub redundancy: RedundancyType,
    pub nodes: Vec<NodeSnapshot>,
    pub pollers: Vec<String>,
    pub buses: Vec<String>,
}

// A shared bus may be listed under more than one category.
fn unique_buses<'a>(buses: impl Iterator<Item = &'a Arc<MessageBus>>) -> Vec<Arc<MessageBus>> {
    let mut unique: Vec<Arc<MessageBus>> = Vec::new();
    for bus in buses {
        if !unique.iter().any(|known| Arc::ptr_eq(known, bus)) {
            unique.push(bus.clone());
        }
    }
    unique
}

impl LogicalAppliance {
    pub fn nodes(&self) -> Vec<Arc<PhysicalAppliance>> {
        let mut nodes = vec![self.primary.clone()];
        nodes.extend(self.backup.iter().cloned());
        nodes
    }

    pub fn all_buses(&self) -> Vec<Arc<MessageBus>> {
        unique_buses(self.mgmt_buses.iter().chain(&self.local_buses).chain(&self.self_buses))
    }

    /// MGMT: management + local, SELF: self buses, BOTH: everything.
    pub fn buses_for(&self, destination: Destination) -> Vec<Arc<MessageBus>> {
        match destination {
            Destination::Mgmt => unique_buses(self.mgmt_buses.iter().chain(&self.local_buses)),
            Destination::SelfVpn => unique_buses(self.self_buses.iter()),
            Destination::Both => self.all_buses(),
        }
    }

    /// Encodings a record for `destination` must be built in.
    pub fn encodings_for(&self, destination: Destination) -> Vec<EncodingKind> {
        let mut kinds: Vec<EncodingKind> = self.buses_for(destination).iter().map(|bus| bus.encoding).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// A management bus already publishing to `host` / `vpn`.
    pub fn has_matching_mgmt_bus(&self, host: &str, vpn: &str) -> bool {
        self.mgmt_buses
            .iter()
            .any(|bus| bus.host.eq_ignore_ascii_case(host) && bus.vpn.as_deref() == Some(vpn))
    }

    /// Pushes the name of the currently active virtual router to every bus.
    pub fn refresh_virtual_router(&self) {
        let active = self
            .nodes()
            .into_iter()
            .find(|node| node.is_currently_active(self.redundancy))
            .map(|node| node.role);
        if let Some(role) = active {
            for bus in self.all_buses() {
                bus.set_virtual_router_name(role.as_str());
            }
        }
    }

    pub fn snapshot(&self) -> ApplianceSnapshot {
        ApplianceSnapshot {
            name: self.name.clone(),
            redundancy: self.redundancy,
            nodes: self.nodes().iter().map(|n| n.snapshot()).collect(),
            pollers: self.pollers.iter().map(|p| p.poller.name.clone()).collect(),
            buses: self.all_buses().iter().map(|b| b.name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::RunConfiguration;

    fn node(role: Role) -> PhysicalAppliance {
        PhysicalAppliance::new(
            "10.0.0.1:8080",
            Credentials { username: "admin".into(), password: "admin".into() },
            role,
            false,
        )
    }

    fn poller(run: RunConfiguration) -> Poller {
        Poller::builder("P")
            .request("<rpc/>")
            .base_path("/rpc-reply/rpc/show/x")
            .run(run)
            .build()
            .unwrap()
    }

    #[test]
    fn standalone_ignores_activity() {
        let n = node(Role::Primary);
        assert!(n.should_run(&poller(RunConfiguration::ACTIVE_ONLY), RedundancyType::Standalone));
        let backup_only = RunConfiguration {
            primary_active_standby: RunCondition::BackupLocalActive,
            ..RunConfiguration::ALWAYS
        };
        assert!(!n.should_run(&poller(backup_only), RedundancyType::Standalone));
    }

    #[test]
    fn active_standby_follows_local_activity() {
        let primary = node(Role::Primary);
        let backup = node(Role::Backup);
        let p = poller(RunConfiguration::ACTIVE_ONLY);
        assert!(!primary.should_run(&p, RedundancyType::ActiveStandby));

        primary.update_activity(LOCAL_ACTIVE, "Mate Active");
        backup.update_activity("Mate Active", "Local Active");
        assert!(primary.should_run(&p, RedundancyType::ActiveStandby));
        // backup_active_standby is PrimaryLocalActive: the backup's primary router is not local
        assert!(!backup.should_run(&p, RedundancyType::ActiveStandby));
        assert!(backup.is_currently_active(RedundancyType::ActiveStandby));
    }

    #[test]
    fn never_never_runs() {
        let n = node(Role::Primary);
        n.update_activity(LOCAL_ACTIVE, LOCAL_ACTIVE);
        let never = RunConfiguration {
            primary_active_active: RunCondition::Never,
            ..RunConfiguration::ALWAYS
        };
        assert!(!n.should_run(&poller(never), RedundancyType::ActiveActive));
    }

    #[test]
    fn vpn_activity_tracking() {
        let n = node(Role::Primary);
        n.update_vpn("default", VpnStatus { enabled: true, operational: true, ..Default::default() });
        n.update_vpn("off", VpnStatus { enabled: false, operational: true, ..Default::default() });
        assert!(n.is_active_vpn("default"));
        assert!(!n.is_active_vpn("off"));
        assert!(!n.is_active_vpn("missing"));
        assert_eq!(n.active_vpns(), vec!["default".to_string()]);
    }

    #[test]
    fn reachability_and_router_name() {
        let n = node(Role::Primary);
        assert!(!n.is_reachable());
        assert_eq!(n.router_name(), "10.0.0.1:8080");
        n.set_router_name("router-a");
        n.declare_reachable();
        assert!(n.is_reachable());
        assert_eq!(n.snapshot().router_name, "router-a");
        n.declare_unreachable();
        assert!(!n.is_reachable());
        assert_eq!(n.semp_url(), "http://10.0.0.1:8080/SEMP");
    }
}
