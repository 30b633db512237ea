//! YAML configuration: pump settings, pollers, poller groups and appliances.
//!
//! The file path comes from `STATSPUMP_CONFIG` (default `statspump.yaml`).
//! Everything is validated here so that a bad file stops the pump before any
//! poll is scheduled.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::appliance::{Credentials, RedundancyType};
use crate::bus::ExceptionAction;
use crate::containers::EncodingKind;
use crate::error::{PumpError, Result};
use crate::poller::{Destination, Poller, RunConfiguration, Scope, DEFAULT_TOPIC_PREFIX};

pub const CONFIG_ENV: &str = "STATSPUMP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "statspump.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PumpConfig {
    #[serde(default)]
    pub pump: PumpSettings,
    #[serde(default)]
    pub pollers: Vec<PollerConf>,
    #[serde(default)]
    pub poller_groups: Vec<PollerGroupConf>,
    #[serde(default)]
    pub appliances: Vec<ApplianceConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    pub queue_capacity: usize,
    pub publish_ttl_ms: u64,
    pub publish_dmq_eligible: bool,
    pub http_connect_timeout_secs: u64,
    pub http_read_timeout_secs: u64,
    pub reachability_retry_secs: u64,
    pub drain_timeout_secs: u64,
    pub queue_report_secs: u64,
    pub mqtt_keep_alive_secs: u64,
    pub status_addr: String,
    pub schema_file: Option<PathBuf>,
    pub topic_prefix: String,
    pub builtin_intervals: BuiltinIntervals,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            publish_ttl_ms: 0,
            publish_dmq_eligible: false,
            http_connect_timeout_secs: 10,
            http_read_timeout_secs: 300,
            reachability_retry_secs: 30,
            drain_timeout_secs: 5,
            queue_report_secs: 60,
            mqtt_keep_alive_secs: 30,
            status_addr: "0.0.0.0:8080".to_string(),
            schema_file: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            builtin_intervals: BuiltinIntervals::default(),
        }
    }
}

/// Seconds between runs of the built-in maintenance pollers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltinIntervals {
    pub hostname: u64,
    pub redundancy: u64,
    pub message_spool: u64,
    pub vpn_detail: u64,
}

impl Default for BuiltinIntervals {
    fn default() -> Self {
        Self { hostname: 300, redundancy: 10, message_spool: 60, vpn_detail: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConf {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_scope")]
    pub scope: Scope,
    pub request: String,
    pub base_path: String,
    pub vpn_name_path: Option<String>,
    /// Tag name -> path relative to `base_path`.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default = "default_destination")]
    pub destination: Destination,
    #[serde(default)]
    pub run: RunConfiguration,
    /// Full template; `~TAG~` levels are substituted per message.
    pub topic: Option<Vec<String>>,
    pub topic_suffix: Option<String>,
    #[serde(default)]
    pub grouped: bool,
}

fn default_scope() -> Scope {
    Scope::System
}

fn default_destination() -> Destination {
    Destination::Mgmt
}

impl PollerConf {
    pub fn to_poller(&self, topic_prefix: &str) -> Result<Poller> {
        let mut builder = Poller::builder(&self.name)
            .description(&self.description)
            .scope(self.scope)
            .request(&self.request)
            .base_path(&self.base_path)
            .destination(self.destination)
            .run(self.run)
            .topic_prefix(topic_prefix)
            .grouped(self.grouped);
        if let Some(path) = &self.vpn_name_path {
            builder = builder.vpn_name_path(path);
        }
        for (tag, path) in &self.tags {
            builder = builder.tag(tag, path);
        }
        if let Some(levels) = &self.topic {
            builder = builder.topic_levels(levels.clone());
        }
        if let Some(suffix) = &self.topic_suffix {
            builder = builder.topic_suffix(suffix);
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerGroupConf {
    pub name: String,
    pub pollers: Vec<GroupMemberConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberConf {
    pub poller: String,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConf {
    /// `host[:port]` of the SEMP endpoint.
    pub host: String,
    pub username: String,
    pub password: Option<String>,
    /// Environment variable holding the password.
    pub password_env: Option<String>,
    #[serde(default)]
    pub secure: bool,
}

impl NodeConf {
    pub fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials {
            username: self.username.clone(),
            password: resolve_password(&self.host, self.password.as_deref(), self.password_env.as_deref())?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConf {
    pub host: String,
    pub vpn: Option<String>,
    #[serde(default)]
    pub username: String,
    pub password: Option<String>,
    pub password_env: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub grouped: bool,
    #[serde(default)]
    pub default_action: ExceptionAction,
    #[serde(default)]
    pub exceptions: Vec<String>,
    /// Per-VPN MQTT port overrides.
    #[serde(default)]
    pub vpn_ports: HashMap<String, u16>,
}

fn default_encoding() -> String {
    "json".to_string()
}

impl BusConf {
    pub fn encoding(&self) -> Result<EncodingKind> {
        EncodingKind::from_key(&self.encoding)
    }

    pub fn password(&self) -> Result<String> {
        if self.password.is_none() && self.password_env.is_none() {
            return Ok(String::new());
        }
        resolve_password(&self.host, self.password.as_deref(), self.password_env.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBusConf {
    /// Key in the listener registry.
    pub listener: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub grouped: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceConf {
    pub name: String,
    #[serde(default = "default_redundancy")]
    pub redundancy: RedundancyType,
    pub primary: NodeConf,
    pub backup: Option<NodeConf>,
    #[serde(default)]
    pub poller_groups: Vec<String>,
    #[serde(default)]
    pub mgmt_buses: Vec<BusConf>,
    #[serde(default)]
    pub self_buses: Vec<BusConf>,
    #[serde(default)]
    pub local_buses: Vec<LocalBusConf>,
}

fn default_redundancy() -> RedundancyType {
    RedundancyType::Standalone
}

/// A literal password, or the value of the named environment variable.
pub fn resolve_password(owner: &str, literal: Option<&str>, env: Option<&str>) -> Result<String> {
    match (literal, env) {
        (Some(password), None) => Ok(password.to_string()),
        (None, Some(var)) => std::env::var(var)
            .map_err(|_| PumpError::Config(format!("{owner}: password variable {var} is not set"))),
        (Some(_), Some(_)) => Err(PumpError::Config(format!("{owner}: both password and password_env given"))),
        (None, None) => Err(PumpError::Config(format!("{owner}: no password configured"))),
    }
}

impl PumpSettings {
    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout_secs)
    }

    pub fn http_read_timeout(&self) -> Duration {
        Duration::from_secs(self.http_read_timeout_secs)
    }

    pub fn reachability_retry(&self) -> Duration {
        Duration::from_secs(self.reachability_retry_secs.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn queue_report_interval(&self) -> Duration {
        Duration::from_secs(self.queue_report_secs.max(1))
    }

    pub fn mqtt_keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keep_alive_secs.max(5))
    }
}

impl PumpConfig {
    pub fn poller(&self, name: &str) -> Option<&PollerConf> {
        self.pollers.iter().find(|p| p.name == name)
    }

    pub fn group(&self, name: &str) -> Option<&PollerGroupConf> {
        self.poller_groups.iter().find(|g| g.name == name)
    }

    /// Cross-reference and value checks; every failure is a `Config` error.
    pub fn validate(&self) -> Result<()> {
        let config_err = |msg: String| Err(PumpError::Config(msg));

        let mut names = HashSet::new();
        for poller in &self.pollers {
            if !names.insert(poller.name.as_str()) {
                return config_err(format!("duplicate poller {}", poller.name));
            }
            poller.to_poller(&self.pump.topic_prefix)?;
        }

        for group in &self.poller_groups {
            for member in &group.pollers {
                if self.poller(&member.poller).is_none() {
                    return config_err(format!("poller group {} references unknown poller {}", group.name, member.poller));
                }
                if member.interval_secs == 0 {
                    return config_err(format!("poller group {}: interval of {} must be > 0", group.name, member.poller));
                }
            }
        }

        let mut appliances = HashSet::new();
        for appliance in &self.appliances {
            if !appliances.insert(appliance.name.as_str()) {
                return config_err(format!("duplicate appliance {}", appliance.name));
            }
            match (appliance.redundancy, &appliance.backup) {
                (RedundancyType::Standalone, Some(_)) => {
                    return config_err(format!("appliance {} is standalone but has a backup node", appliance.name));
                }
                (RedundancyType::ActiveStandby | RedundancyType::ActiveActive, None) => {
                    return config_err(format!("appliance {} needs a backup node", appliance.name));
                }
                _ => {}
            }
            for group in &appliance.poller_groups {
                if self.group(group).is_none() {
                    return config_err(format!("appliance {} references unknown poller group {}", appliance.name, group));
                }
            }
            for bus in appliance.mgmt_buses.iter().chain(&appliance.self_buses) {
                bus.encoding()?;
                for pattern in &bus.exceptions {
                    if pattern.is_empty() {
                        return config_err(format!("appliance {}: empty VPN exception on {}", appliance.name, bus.host));
                    }
                }
            }
            for bus in &appliance.mgmt_buses {
                if bus.vpn.is_none() {
                    return config_err(format!("appliance {}: management bus {} needs a VPN", appliance.name, bus.host));
                }
            }
            for bus in &appliance.self_buses {
                if bus.vpn.is_none() && bus.vpn_ports.is_empty() {
                    return config_err(format!(
                        "appliance {}: self bus {} publishes into origin VPNs and needs vpn_ports",
                        appliance.name, bus.host
                    ));
                }
            }
            for local in &appliance.local_buses {
                EncodingKind::from_key(&local.encoding)?;
            }
        }
        Ok(())
    }
}

pub fn parse_config(text: &str) -> Result<PumpConfig> {
    if text.trim().is_empty() {
        return Ok(PumpConfig::default());
    }
    let config: PumpConfig = serde_yaml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

pub async fn load_config_from(path: &Path) -> Result<PumpConfig> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|e| PumpError::Config(format!("cannot read {}: {e}", path.display())))?;
    let config = parse_config(&text)?;
    info!(
        "Loaded {} ({} pollers, {} groups, {} appliances)",
        path.display(),
        config.pollers.len(),
        config.poller_groups.len(),
        config.appliances.len()
    );
    Ok(config)
}

pub async fn load_config() -> Result<PumpConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(Path::new(&path)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
pump:
  queue_capacity: 50
  publish_ttl_ms: 30000
  topic_prefix: METRICS
pollers:
  - name: ClientStats
    scope: VPN
    request: "<rpc semp-version='%s'><show><client><name>*</name><stats/></client></show></rpc>"
    base_path: /rpc-reply/rpc/show/client/primary-virtual-router/client
    vpn_name_path: /message-vpn
    tags:
      CLIENT_NAME: /name
    destination: BOTH
    topic_suffix: CLIENTS
poller_groups:
  - name: basic
    pollers:
      - poller: ClientStats
        interval_secs: 30
appliances:
  - name: lab
    redundancy: active-standby
    primary: { host: "10.0.0.1:8080", username: admin, password: admin }
    backup: { host: "10.0.0.2:8080", username: admin, password_env: STATSPUMP_TEST_BACKUP_PW }
    poller_groups: [basic]
    mgmt_buses:
      - host: "collector:1883"
        vpn: mgmt
        encoding: camel-json
    self_buses:
      - host: "10.0.0.1:1883"
        default_action: deny
        exceptions: ["prod*"]
        vpn_ports: { prod-eu: 1884, prod-us: 1885 }
    local_buses:
      - listener: logging
"#;

    #[test]
    fn sample_parses_and_validates() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.pump.queue_capacity, 50);
        assert_eq!(config.pump.http_read_timeout_secs, 300);
        assert_eq!(config.pump.builtin_intervals.redundancy, 10);
        let lab = &config.appliances[0];
        assert_eq!(lab.redundancy, RedundancyType::ActiveStandby);
        assert_eq!(lab.self_buses[0].default_action, ExceptionAction::Deny);
        assert_eq!(lab.mgmt_buses[0].encoding().unwrap(), EncodingKind::CamelJson);

        let poller = config.pollers[0].to_poller(&config.pump.topic_prefix).unwrap();
        assert_eq!(poller.scope, Scope::Vpn);
        assert_eq!(poller.destination, Destination::Both);
        assert_eq!(poller.topic_levels[0], crate::poller::TopicLevel::Literal("METRICS".into()));
    }

    #[test]
    fn unknown_references_are_rejected() {
        let bad_group = SAMPLE.replace("poller_groups: [basic]", "poller_groups: [missing]");
        assert!(matches!(parse_config(&bad_group), Err(PumpError::Config(_))));

        let bad_poller = SAMPLE.replace("- poller: ClientStats", "- poller: Nope");
        assert!(matches!(parse_config(&bad_poller), Err(PumpError::Config(_))));

        let bad_encoding = SAMPLE.replace("encoding: camel-json", "encoding: avro");
        assert!(matches!(parse_config(&bad_encoding), Err(PumpError::UnknownEncoding(_))));
    }

    #[test]
    fn origin_vpn_self_bus_needs_listener_ports() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.appliances[0].self_buses[0].vpn_ports["prod-eu"], 1884);

        let text = SAMPLE.replace("        vpn_ports: { prod-eu: 1884, prod-us: 1885 }\n", "");
        let err = parse_config(&text).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("vpn_ports"));
    }

    #[test]
    fn system_self_poller_is_rejected() {
        let text = SAMPLE.replace("scope: VPN", "scope: SYSTEM").replace("destination: BOTH", "destination: SELF");
        let err = parse_config(&text).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("SELF"));
    }

    #[test]
    fn password_sources() {
        assert_eq!(resolve_password("n", Some("pw"), None).unwrap(), "pw");
        assert!(resolve_password("n", None, Some("STATSPUMP_TEST_SURELY_UNSET_VAR")).is_err());
        assert!(resolve_password("n", Some("a"), Some("B")).is_err());
        assert!(resolve_password("n", None, None).is_err());
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_config_from(file.path()).await.unwrap();
        assert_eq!(config.appliances.len(), 1);

        let missing = load_config_from(Path::new("/nonexistent/statspump.yaml")).await;
        assert!(matches!(missing, Err(PumpError::Config(_))));
    }
}
