use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::appliance::{LogicalAppliance, PhysicalAppliance};
use crate::containers::{EncodingKind, WirePayload};
use crate::error::{PumpError, Result};
use crate::poller::{Destination, Poller, Scope, TopicLevel, ROUTER_NAME_TAG, VPN_NAME_TAG};

/// Topic level used for the VPN of a grouped message.
pub const ALL_VPNS: &str = "ALL";

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

/// Percent-escapes the characters a publish topic level cannot carry, so
/// `#config-sync` becomes `%23config-sync`.
pub fn escape_level(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '#' => escaped.push_str("%23"),
            '+' => escaped.push_str("%2B"),
            '/' => escaped.push_str("%2F"),
            '\0' => escaped.push_str("%00"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Resolves a topic template; unknown tags resolve to an empty level.
/// Substituted values are escaped, literals are taken as configured.
pub fn resolve_topic(levels: &[TopicLevel], tags: &BTreeMap<String, String>, router_name: &str) -> Vec<String> {
    levels
        .iter()
        .map(|level| match level {
            TopicLevel::Literal(text) => text.clone(),
            TopicLevel::Tag(tag) if tag == ROUTER_NAME_TAG => escape_level(router_name),
            TopicLevel::Tag(tag) => tags.get(tag).map(|value| escape_level(value)).unwrap_or_default(),
        })
        .collect()
}

/// Publish topics may not contain wildcards or empty levels.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.split('/').any(str::is_empty) {
        return Err(PumpError::Publish(format!("empty level in topic '{topic}'")));
    }
    if topic.contains(['#', '+', '\0']) {
        return Err(PumpError::Publish(format!("wildcard in topic '{topic}'")));
    }
    Ok(())
}

/// One decoded record (or one grouped cycle), shared read-only by every bus
/// worker it is routed to.
pub struct StatsMessage {
    pub id: Uuid,
    pub poller: Arc<Poller>,
    pub logical: Arc<LogicalAppliance>,
    pub origin: Arc<PhysicalAppliance>,
    pub router_name: String,
    /// `None` for appliance-wide messages.
    pub vpn: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub payloads: BTreeMap<EncodingKind, WirePayload>,
    pub topic_levels: Vec<String>,
    pub created: OffsetDateTime,
    pub grouped: bool,
}

impl std::fmt::Debug for StatsMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsMessage")
            .field("id", &self.id)
            .field("poller", &self.poller.name)
            .field("router", &self.router_name)
            .field("vpn", &self.vpn)
            .field("topic", &self.topic())
            .field("grouped", &self.grouped)
            .finish()
    }
}

/// Bus-local framing applied right before serialization.
#[derive(Debug, Clone, Default)]
pub struct Framing {
    pub ttl_ms: u64,
    pub dmq_eligible: bool,
    pub compressed: bool,
    pub virtual_router: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub content_type: &'static str,
    pub encoding: EncodingKind,
    pub compressed: bool,
    pub ttl_ms: u64,
    pub dmq_eligible: bool,
    pub properties: BTreeMap<String, String>,
}

impl StatsMessage {
    pub fn new(
        poller: Arc<Poller>,
        logical: Arc<LogicalAppliance>,
        origin: Arc<PhysicalAppliance>,
        tags: BTreeMap<String, String>,
        payloads: BTreeMap<EncodingKind, WirePayload>,
    ) -> Self {
        let router_name = origin.router_name();
        let vpn = match poller.scope {
            Scope::Vpn => tags.get(VPN_NAME_TAG).cloned(),
            Scope::System => None,
        };
        let topic_levels = resolve_topic(&poller.topic_levels, &tags, &router_name);
        Self {
            id: Uuid::new_v4(),
            poller,
            logical,
            origin,
            router_name,
            vpn,
            tags,
            payloads,
            topic_levels,
            created: OffsetDateTime::now_utc(),
            grouped: false,
        }
    }

    /// All records of a VPN-scope cycle in one message, VPN level set to `ALL`.
    pub fn grouped(
        poller: Arc<Poller>,
        logical: Arc<LogicalAppliance>,
        origin: Arc<PhysicalAppliance>,
        payloads: BTreeMap<EncodingKind, WirePayload>,
    ) -> Self {
        let tags = BTreeMap::from([(VPN_NAME_TAG.to_string(), ALL_VPNS.to_string())]);
        let mut message = StatsMessage::new(poller, logical, origin, tags, payloads);
        message.vpn = None;
        message.grouped = true;
        message
    }

    pub fn scope(&self) -> Scope {
        self.poller.scope
    }

    pub fn destination(&self) -> Destination {
        self.poller.destination
    }

    pub fn topic(&self) -> String {
        self.topic_levels.join("/")
    }

    pub fn to_wire(&self, encoding: EncodingKind, framing: &Framing) -> Result<WireMessage> {
        let payload = self.payloads.get(&encoding).ok_or_else(|| {
            PumpError::Publish(format!("message {} has no {} payload", self.id, encoding.key()))
        })?;
        let mut bytes = payload.to_bytes()?;
        if framing.compressed {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
            encoder.write_all(&bytes)?;
            bytes = encoder.finish()?;
        }

        let mut properties = BTreeMap::new();
        properties.insert("message-id".to_string(), self.id.to_string());
        properties.insert("poller".to_string(), self.poller.name.clone());
        properties.insert("router".to_string(), self.router_name.clone());
        properties.insert("scope".to_string(), self.scope().as_str().to_string());
        properties.insert("timestamp".to_string(), format_timestamp(self.created));
        if let Some(vpn) = &self.vpn {
            properties.insert("vpn".to_string(), vpn.clone());
        }
        if let Some(router) = &framing.virtual_router {
            properties.insert("virtual-router".to_string(), router.clone());
        }

        Ok(WireMessage {
            topic: self.topic(),
            payload: bytes,
            content_type: payload.content_type(),
            encoding,
            compressed: framing.compressed,
            ttl_ms: framing.ttl_ms,
            dmq_eligible: framing.dmq_eligible,
            properties,
        })
    }
}
