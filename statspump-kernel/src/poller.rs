//! Poller descriptors: what to ask a node, where the repeating record sits in
//! the reply, which fields to lift out as object tags, where the result goes
//! and under which redundancy state the poll may run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{PumpError, Result};

pub const VPN_NAME_TAG: &str = "VPN_NAME";
pub const ROUTER_NAME_TAG: &str = "ROUTER_NAME";
pub const DEFAULT_TOPIC_PREFIX: &str = "STATS";

// Object tags read by the built-in maintenance pollers
pub const HOSTNAME_TAG: &str = "HOSTNAME";
pub const REDUNDANCY_MODE_TAG: &str = "REDUNDANCY_MODE";
pub const PRIMARY_ACTIVITY_TAG: &str = "PRIMARY_ACTIVITY";
pub const BACKUP_ACTIVITY_TAG: &str = "BACKUP_ACTIVITY";
pub const PRIMARY_ACTIVITY_DETAIL_TAG: &str = "PRIMARY_ACTIVITY_DETAIL";
pub const BACKUP_ACTIVITY_DETAIL_TAG: &str = "BACKUP_ACTIVITY_DETAIL";
pub const AD_STATUS_TAG: &str = "AD_STATUS";
pub const ENABLED_TAG: &str = "ENABLED";
pub const OPERATIONAL_TAG: &str = "OPERATIONAL";
pub const LOCALLY_CONFIGURED_TAG: &str = "LOCALLY_CONFIGURED";
pub const LOCAL_STATUS_TAG: &str = "LOCAL_STATUS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    System,
    Vpn,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::System => "SYSTEM",
            Scope::Vpn => "VPN",
        }
    }
}

/// Which category of message bus a record is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    #[serde(rename = "MGMT")]
    Mgmt,
    #[serde(rename = "SELF")]
    SelfVpn,
    #[serde(rename = "BOTH")]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunCondition {
    Always,
    Never,
    PrimaryLocalActive,
    BackupLocalActive,
}

/// Condition per (node role × redundancy mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub primary_active_standby: RunCondition,
    pub backup_active_standby: RunCondition,
    pub primary_active_active: RunCondition,
    pub backup_active_active: RunCondition,
}

impl RunConfiguration {
    pub const ALWAYS: RunConfiguration = RunConfiguration {
        primary_active_standby: RunCondition::Always,
        backup_active_standby: RunCondition::Always,
        primary_active_active: RunCondition::Always,
        backup_active_active: RunCondition::Always,
    };

    /// Poll only the node currently serving the primary virtual router.
    pub const ACTIVE_ONLY: RunConfiguration = RunConfiguration {
        primary_active_standby: RunCondition::PrimaryLocalActive,
        backup_active_standby: RunCondition::PrimaryLocalActive,
        primary_active_active: RunCondition::PrimaryLocalActive,
        backup_active_active: RunCondition::BackupLocalActive,
    };
}

impl Default for RunConfiguration {
    fn default() -> Self {
        RunConfiguration::ALWAYS
    }
}

/// Built-in pollers feed appliance state besides publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PollerKind {
    Generic,
    Hostname,
    Redundancy,
    MessageSpool,
    VpnDetail,
}

/// One level of a topic template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TopicLevel {
    Literal(String),
    /// `~TAG~` in configuration, replaced by the tag value per message.
    Tag(String),
}

impl TopicLevel {
    pub fn parse(raw: &str) -> TopicLevel {
        match raw.strip_prefix('~').and_then(|r| r.strip_suffix('~')) {
            Some(tag) if !tag.is_empty() => TopicLevel::Tag(tag.to_string()),
            _ => TopicLevel::Literal(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Poller {
    pub name: String,
    pub description: String,
    pub scope: Scope,
    pub kind: PollerKind,
    pub semp_request: String,
    pub base_path: String,
    /// Path of the VPN name relative to `base_path` (VPN scope only).
    pub vpn_name_path: Option<String>,
    /// Tag name -> path relative to `base_path`.
    pub object_tags: BTreeMap<String, String>,
    pub destination: Destination,
    pub run: RunConfiguration,
    pub topic_levels: Vec<TopicLevel>,
    pub grouped: bool,
}

impl Poller {
    pub fn builder(name: impl Into<String>) -> PollerBuilder {
        PollerBuilder::new(name)
    }

    /// Request text with the node's SEMP version substituted.
    pub fn request_for(&self, semp_version: &str) -> String {
        self.semp_request.replace("%s", semp_version)
    }

    /// Absolute element path -> tag name, VPN name included.
    pub fn tag_paths(&self) -> BTreeMap<String, String> {
        let mut paths: BTreeMap<String, String> = self
            .object_tags
            .iter()
            .map(|(tag, rel)| (self.absolute(rel), tag.clone()))
            .collect();
        if let Some(rel) = &self.vpn_name_path {
            paths.insert(self.absolute(rel), VPN_NAME_TAG.to_string());
        }
        paths
    }

    fn absolute(&self, relative: &str) -> String {
        format!("{}/{}", self.base_path.trim_end_matches('/'), relative.trim_start_matches('/'))
    }

    pub fn hostname() -> Poller {
        Poller::builder("HostnamePoller")
            .kind(PollerKind::Hostname)
            .description("Router hostname")
            .request("<rpc semp-version='%s'><show><hostname/></show></rpc>")
            .base_path("/rpc-reply/rpc/show/hostname")
            .tag(HOSTNAME_TAG, "/hostname")
            .topic_suffix("HOSTNAME")
            .build_builtin()
    }

    pub fn redundancy() -> Poller {
        Poller::builder("RedundancyPoller")
            .kind(PollerKind::Redundancy)
            .description("Redundancy detail")
            .request("<rpc semp-version='%s'><show><redundancy><detail/></redundancy></show></rpc>")
            .base_path("/rpc-reply/rpc/show/redundancy")
            .tag(REDUNDANCY_MODE_TAG, "/redundancy-mode")
            .tag(PRIMARY_ACTIVITY_TAG, "/virtual-routers/primary/status/activity")
            .tag(BACKUP_ACTIVITY_TAG, "/virtual-routers/backup/status/activity")
            .tag(PRIMARY_ACTIVITY_DETAIL_TAG, "/virtual-routers/primary/status/detail/activity-status/summary")
            .tag(BACKUP_ACTIVITY_DETAIL_TAG, "/virtual-routers/backup/status/detail/activity-status/summary")
            .topic_suffix("REDUNDANCY")
            .build_builtin()
    }

    pub fn message_spool() -> Poller {
        Poller::builder("MessageSpoolPoller")
            .kind(PollerKind::MessageSpool)
            .description("Message spool status")
            .request("<rpc semp-version='%s'><show><message-spool/></show></rpc>")
            .base_path("/rpc-reply/rpc/show/message-spool/message-spool-info")
            .tag(AD_STATUS_TAG, "/operational-status")
            .topic_suffix("MSG-SPOOL")
            .build_builtin()
    }

    pub fn vpn_detail() -> Poller {
        Poller::builder("VpnDetailPoller")
            .kind(PollerKind::VpnDetail)
            .scope(Scope::Vpn)
            .destination(Destination::Both)
            .description("Message VPN detail")
            .request(
                "<rpc semp-version='%s'><show><message-vpn><vpn-name>*</vpn-name><detail/><count/>\
                 <num-elements>1000</num-elements></message-vpn></show></rpc>",
            )
            .base_path("/rpc-reply/rpc/show/message-vpn/vpn")
            .vpn_name_path("/name")
            .tag(ENABLED_TAG, "/enabled")
            .tag(OPERATIONAL_TAG, "/operational")
            .tag(LOCALLY_CONFIGURED_TAG, "/locally-configured")
            .tag(LOCAL_STATUS_TAG, "/local-status")
            .tag("SMF_TOPIC_FORMAT", "/event-configuration/publish-topic-format/smf")
            .tag("MQTT_TOPIC_FORMAT", "/event-configuration/publish-topic-format/mqtt")
            .topic_suffix("DETAIL")
            .build_builtin()
    }

    /// Swaps the default leading topic level for `prefix`.
    pub fn with_topic_prefix(mut self, prefix: &str) -> Poller {
        if let Some(first) = self.topic_levels.first_mut() {
            if *first == TopicLevel::Literal(DEFAULT_TOPIC_PREFIX.to_string()) {
                *first = TopicLevel::Literal(prefix.to_string());
            }
        }
        self
    }

    /// The three bootstrap steps, in the order they must succeed.
    pub fn bootstrap_sequence() -> [Poller; 3] {
        [Poller::hostname(), Poller::redundancy(), Poller::message_spool()]
    }
}

pub struct PollerBuilder {
    name: String,
    description: String,
    scope: Scope,
    kind: PollerKind,
    request: String,
    base_path: String,
    vpn_name_path: Option<String>,
    object_tags: BTreeMap<String, String>,
    destination: Destination,
    run: RunConfiguration,
    topic_levels: Option<Vec<String>>,
    topic_prefix: String,
    topic_suffix: Option<String>,
    grouped: bool,
}

impl PollerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            scope: Scope::System,
            kind: PollerKind::Generic,
            request: String::new(),
            base_path: String::new(),
            vpn_name_path: None,
            object_tags: BTreeMap::new(),
            destination: Destination::Mgmt,
            run: RunConfiguration::ALWAYS,
            topic_levels: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            topic_suffix: None,
            grouped: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn kind(mut self, kind: PollerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn request(mut self, request: impl Into<String>) -> Self {
        self.request = request.into();
        self
    }

    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn vpn_name_path(mut self, path: impl Into<String>) -> Self {
        self.vpn_name_path = Some(path.into());
        self
    }

    pub fn tag(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.object_tags.insert(name.into(), path.into());
        self
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn run(mut self, run: RunConfiguration) -> Self {
        self.run = run;
        self
    }

    /// Explicit template, literal levels and `~TAG~` placeholders.
    pub fn topic_levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topic_levels = Some(levels.into_iter().map(Into::into).collect());
        self
    }

    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    pub fn topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.topic_suffix = Some(suffix.into());
        self
    }

    pub fn grouped(mut self, grouped: bool) -> Self {
        self.grouped = grouped;
        self
    }

    fn default_levels(&self) -> Vec<String> {
        let mut levels = vec![self.topic_prefix.clone(), self.scope.as_str().to_string()];
        levels.push(format!("~{ROUTER_NAME_TAG}~"));
        if self.scope == Scope::Vpn {
            levels.push(format!("~{VPN_NAME_TAG}~"));
        }
        levels.push(self.topic_suffix.clone().unwrap_or_else(|| self.name.to_uppercase()));
        levels
    }

    pub fn build(self) -> Result<Poller> {
        let invalid = |reason: &str| PumpError::Config(format!("poller {}: {reason}", self.name));
        if self.scope == Scope::System && self.destination == Destination::SelfVpn {
            return Err(invalid("SYSTEM scope pollers cannot publish to SELF"));
        }
        if self.request.trim().is_empty() {
            return Err(invalid("empty SEMP request"));
        }
        if !self.base_path.starts_with('/') {
            return Err(invalid("base path must be absolute"));
        }
        if self.scope == Scope::Vpn && self.vpn_name_path.is_none() {
            return Err(invalid("VPN scope pollers need a vpn name tag"));
        }
        let raw_levels = self.topic_levels.clone().unwrap_or_else(|| self.default_levels());
        if raw_levels.iter().any(|level| level.is_empty()) {
            return Err(invalid("empty topic level"));
        }
        Ok(self.assemble())
    }

    /// Built-in definitions are constants and skip validation.
    fn build_builtin(self) -> Poller {
        self.assemble()
    }

    fn assemble(self) -> Poller {
        let raw_levels = self.topic_levels.clone().unwrap_or_else(|| self.default_levels());
        Poller {
            topic_levels: raw_levels.iter().map(|l| TopicLevel::parse(l)).collect(),
            name: self.name,
            description: self.description,
            scope: self.scope,
            kind: self.kind,
            semp_request: self.request,
            base_path: self.base_path.trim_end_matches('/').to_string(),
            vpn_name_path: self.vpn_name_path,
            object_tags: self.object_tags,
            destination: self.destination,
            run: self.run,
            grouped: self.grouped,
        }
    }
}
