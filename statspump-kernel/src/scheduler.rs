/**
 * SCHEDULER - poll cycles, bootstrap and reachability
 *
 * ROLE:
 * Every (node, poller) pair runs on its own interval task. A tick is skipped
 * while the node is unreachable or the poller's run-condition is false.
 * A poll cycle posts the request, decodes every page of the reply on a
 * blocking thread, and routes each record as soon as it is decoded.
 *
 * HOW IT WORKS:
 * - bootstrap = hostname, redundancy, message spool, in that order, each
 *   once; the node is declared reachable only if all three succeed
 * - the reachability probe re-runs the bootstrap while a node is unreachable
 * - a connect/timeout failure on a scheduled poll marks the node unreachable
 * - built-in pollers also update the appliance state from their tags
 */

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::appliance::{LogicalAppliance, PhysicalAppliance, ScheduledPoller, VpnStatus, UNINITIALIZED};
use crate::containers::{EncodingKind, GroupedContainer};
use crate::decoder::{DecodedRecord, RecordSink, ReplyDecoder};
use crate::error::{PumpError, Result};
use crate::health::PumpHealth;
use crate::message::{format_timestamp, StatsMessage};
use crate::poller::{
    Poller, PollerKind, Scope, AD_STATUS_TAG, BACKUP_ACTIVITY_DETAIL_TAG, BACKUP_ACTIVITY_TAG, ENABLED_TAG,
    HOSTNAME_TAG, LOCALLY_CONFIGURED_TAG, LOCAL_STATUS_TAG, OPERATIONAL_TAG, PRIMARY_ACTIVITY_DETAIL_TAG,
    PRIMARY_ACTIVITY_TAG, REDUNDANCY_MODE_TAG, VPN_NAME_TAG,
};
use crate::router;
use crate::schema::SchemaRegistry;
use crate::semp::SempTransport;
use crate::state::{new_state, Shared};

/// Upper bound on more-cookie pages followed in one cycle.
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollState {
    Idle,
    Requested,
    AwaitingReply,
    Decoding,
    Publishing,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollStats {
    pub poller: String,
    pub host: String,
    pub state: PollState,
    pub runs: u64,
    pub skipped: u64,
    pub failures: u64,
    pub records: u64,
    pub published: u64,
    pub requeries: u64,
    pub last_run: Option<String>,
    pub last_error: Option<String>,
}

impl PollStats {
    fn new(poller: &str, host: &str) -> Self {
        Self {
            poller: poller.to_string(),
            host: host.to_string(),
            state: PollState::Idle,
            runs: 0,
            skipped: 0,
            failures: 0,
            records: 0,
            published: 0,
            requeries: 0,
            last_run: None,
            last_error: None,
        }
    }
}

/// Last state and counters per (poller, host).
#[derive(Clone, Default)]
pub struct PollTracker {
    table: Shared<BTreeMap<(String, String), PollStats>>,
}

impl PollTracker {
    pub fn new() -> Self {
        Self { table: new_state(BTreeMap::new()) }
    }

    fn update(&self, poller: &str, host: &str, f: impl FnOnce(&mut PollStats)) {
        let mut table = self.table.lock();
        let stats = table
            .entry((poller.to_string(), host.to_string()))
            .or_insert_with(|| PollStats::new(poller, host));
        f(stats);
    }

    pub fn set_state(&self, poller: &str, host: &str, state: PollState) {
        self.update(poller, host, |s| s.state = state);
    }

    pub fn record_skip(&self, poller: &str, host: &str) {
        self.update(poller, host, |s| {
            s.skipped += 1;
            s.state = PollState::Idle;
        });
    }

    pub fn record_success(&self, poller: &str, host: &str, report: &CycleReport) {
        self.update(poller, host, |s| {
            s.runs += 1;
            s.records += report.records as u64;
            s.published += report.published as u64;
            s.requeries += report.requeries as u64;
            s.state = PollState::Idle;
            s.last_run = Some(format_timestamp(OffsetDateTime::now_utc()));
            s.last_error = None;
        });
    }

    pub fn record_failure(&self, poller: &str, host: &str, error: &PumpError) {
        self.update(poller, host, |s| {
            s.runs += 1;
            s.failures += 1;
            s.state = PollState::Failed;
            s.last_run = Some(format_timestamp(OffsetDateTime::now_utc()));
            s.last_error = Some(error.to_string());
        });
    }

    pub fn get(&self, poller: &str, host: &str) -> Option<PollStats> {
        self.table.lock().get(&(poller.to_string(), host.to_string())).cloned()
    }

    pub fn snapshot(&self) -> Vec<PollStats> {
        self.table.lock().values().cloned().collect()
    }
}

/// Collaborators shared by every poll task.
#[derive(Clone)]
pub struct PollContext {
    pub transport: Arc<dyn SempTransport>,
    pub schema: Arc<SchemaRegistry>,
    pub health: PumpHealth,
    pub polls: PollTracker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub records: usize,
    /// Bus enqueues, grouped messages included.
    pub published: usize,
    pub requeries: usize,
}

/// Record handler of one poll cycle, running on the decoder thread.
struct CycleSink {
    logical: Arc<LogicalAppliance>,
    node: Arc<PhysicalAppliance>,
    poller: Arc<Poller>,
    publish: bool,
    groups: Option<BTreeMap<EncodingKind, GroupedContainer>>,
    records: usize,
    published: usize,
}

impl CycleSink {
    fn new(logical: Arc<LogicalAppliance>, node: Arc<PhysicalAppliance>, poller: Arc<Poller>, publish: bool) -> Self {
        let groups = (publish && poller.grouped).then(BTreeMap::new);
        Self { logical, node, poller, publish, groups, records: 0, published: 0 }
    }

    fn apply_state(&self, tags: &BTreeMap<String, String>) {
        let tag = |name: &str| tags.get(name).map(String::as_str).filter(|v| !v.is_empty());
        match self.poller.kind {
            PollerKind::Generic => {}
            PollerKind::Hostname => {
                if let Some(hostname) = tag(HOSTNAME_TAG) {
                    self.node.set_router_name(hostname);
                }
            }
            PollerKind::Redundancy => {
                if let Some(mode) = tag(REDUNDANCY_MODE_TAG) {
                    self.node.set_redundancy_mode(mode);
                }
                let activity = |detail: &str, summary: &str| {
                    tag(detail)
                        .filter(|v| *v != UNINITIALIZED)
                        .or_else(|| tag(summary))
                        .unwrap_or(UNINITIALIZED)
                        .to_string()
                };
                let primary = activity(PRIMARY_ACTIVITY_DETAIL_TAG, PRIMARY_ACTIVITY_TAG);
                let backup = activity(BACKUP_ACTIVITY_DETAIL_TAG, BACKUP_ACTIVITY_TAG);
                if self.node.update_activity(&primary, &backup) {
                    self.logical.refresh_virtual_router();
                }
            }
            PollerKind::MessageSpool => {
                if let Some(status) = tag(AD_STATUS_TAG) {
                    self.node.set_ad_status(status);
                }
            }
            PollerKind::VpnDetail => {
                if let Some(name) = tag(VPN_NAME_TAG) {
                    let flag = |name: &str| tag(name).is_some_and(|v| v.eq_ignore_ascii_case("true"));
                    self.node.update_vpn(
                        name,
                        VpnStatus {
                            enabled: flag(ENABLED_TAG),
                            operational: flag(OPERATIONAL_TAG),
                            locally_configured: flag(LOCALLY_CONFIGURED_TAG),
                            local_status: tag(LOCAL_STATUS_TAG).unwrap_or_default().to_string(),
                        },
                    );
                }
            }
        }
    }

    fn may_publish(&self) -> bool {
        if !self.publish {
            return false;
        }
        match self.poller.kind {
            PollerKind::VpnDetail => self.node.is_currently_active(self.logical.redundancy),
            _ => true,
        }
    }

    /// Grouped messages collected over the cycle, one per poller.
    fn take_grouped(&mut self) -> Option<StatsMessage> {
        let groups = self.groups.take()?;
        if groups.values().all(GroupedContainer::is_empty) {
            return None;
        }
        let payloads = groups.into_iter().map(|(kind, group)| (kind, group.finish())).collect();
        Some(StatsMessage::grouped(self.poller.clone(), self.logical.clone(), self.node.clone(), payloads))
    }
}

impl RecordSink for CycleSink {
    fn on_record(&mut self, record: DecodedRecord) -> Result<()> {
        self.records += 1;
        self.apply_state(&record.tags);
        if !self.may_publish() {
            return Ok(());
        }
        if self.poller.scope == Scope::Vpn && !record.tags.contains_key(VPN_NAME_TAG) {
            warn!("{} record from {} has no VPN name, skipping", self.poller.name, self.node.host);
            return Ok(());
        }

        if let Some(groups) = self.groups.as_mut() {
            let base = self.poller.base_path.rsplit('/').next().unwrap_or_default().to_string();
            for (kind, payload) in &record.payloads {
                groups
                    .entry(*kind)
                    .or_insert_with(|| GroupedContainer::new(*kind, base.clone()))
                    .add_payload(payload.clone());
            }
        }

        let msg = Arc::new(StatsMessage::new(
            self.poller.clone(),
            self.logical.clone(),
            self.node.clone(),
            record.tags,
            record.payloads,
        ));
        self.published += router::route_blocking(&msg)?;
        Ok(())
    }
}

/// Runs one poll cycle, following more-cookies until the reply is complete.
///
/// With `publish` unset only the appliance state is updated.
pub async fn run_poll_cycle(
    ctx: &PollContext,
    logical: &Arc<LogicalAppliance>,
    node: &Arc<PhysicalAppliance>,
    poller: &Arc<Poller>,
    publish: bool,
) -> Result<CycleReport> {
    let encodings = if publish { logical.encodings_for(poller.destination) } else { Vec::new() };
    let mut sink = CycleSink::new(logical.clone(), node.clone(), poller.clone(), publish);
    let mut request = poller.request_for(&node.semp_version());
    let mut requeries = 0;
    ctx.health.record_poll_cycle();

    for page in 0.. {
        ctx.polls.set_state(&poller.name, &node.host, PollState::Requested);
        debug!("Polling {} on {} (page {})", poller.name, node.host, page + 1);
        ctx.polls.set_state(&poller.name, &node.host, PollState::AwaitingReply);
        let body = ctx.transport.post(node, &request).await?;

        ctx.polls.set_state(&poller.name, &node.host, PollState::Decoding);
        let (schema, decode_poller, kinds, version) =
            (ctx.schema.clone(), poller.clone(), encodings.clone(), node.semp_version());
        let (outcome, returned) = task::spawn_blocking(move || {
            let decoder = ReplyDecoder::new(&decode_poller, &schema, kinds, version);
            let outcome = decoder.decode(&body[..], &mut sink);
            (outcome, sink)
        })
        .await
        .map_err(|e| PumpError::Decode(format!("decoder task for {} failed: {e}", poller.name)))?;
        sink = returned;
        let outcome = outcome?;
        ctx.health.record_decoded(outcome.records);

        if let Some(version) = &outcome.semp_version {
            node.set_semp_version(version);
        }
        match outcome.more_cookie {
            Some(next) if page + 1 < MAX_PAGES => {
                requeries += 1;
                ctx.health.record_requery();
                request = next;
            }
            Some(_) => {
                warn!("{} on {} still paginating after {} pages, stopping", poller.name, node.host, MAX_PAGES);
                break;
            }
            None => break,
        }
    }

    if let Some(grouped) = sink.take_grouped() {
        ctx.polls.set_state(&poller.name, &node.host, PollState::Publishing);
        sink.published += router::route(&Arc::new(grouped)).await?;
    }

    Ok(CycleReport { records: sink.records, published: sink.published, requeries })
}

/// Hostname, redundancy and message spool, once each, then reachable.
pub async fn bootstrap(ctx: &PollContext, logical: &Arc<LogicalAppliance>, node: &Arc<PhysicalAppliance>) -> Result<()> {
    for poller in Poller::bootstrap_sequence() {
        let poller = Arc::new(poller);
        run_poll_cycle(ctx, logical, node, &poller, false).await.map_err(|e| {
            warn!("Bootstrap of {} failed at {}: {}", node.host, poller.name, e);
            e
        })?;
    }
    node.declare_reachable();
    logical.refresh_virtual_router();
    Ok(())
}

/// One scheduled tick of `scheduled` on `node`.
pub async fn run_scheduled(
    ctx: &PollContext,
    logical: &Arc<LogicalAppliance>,
    node: &Arc<PhysicalAppliance>,
    scheduled: &ScheduledPoller,
) {
    let poller = &scheduled.poller;
    if !node.is_reachable() {
        return;
    }
    if !node.should_run(poller, logical.redundancy) {
        ctx.polls.record_skip(&poller.name, &node.host);
        return;
    }
    match run_poll_cycle(ctx, logical, node, poller, true).await {
        Ok(report) => {
            debug!(
                "{} on {}: {} records, {} enqueued, {} re-queries",
                poller.name, node.host, report.records, report.published, report.requeries
            );
            ctx.polls.record_success(&poller.name, &node.host, &report);
        }
        Err(e) => {
            error!("{} on {} failed: {}", poller.name, node.host, e);
            ctx.health.record_poll_failure();
            ctx.polls.record_failure(&poller.name, &node.host, &e);
            if e.is_unreachable() {
                node.declare_unreachable();
            }
        }
    }
}

pub fn spawn_poller_task(
    ctx: PollContext,
    logical: Arc<LogicalAppliance>,
    node: Arc<PhysicalAppliance>,
    scheduled: ScheduledPoller,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut interval = tokio::time::interval(scheduled.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            run_scheduled(&ctx, &logical, &node, &scheduled).await;
        }
        debug!("Poller {} on {} stopped", scheduled.poller.name, node.host);
    })
}

/// Re-runs the bootstrap every `every` while the node is unreachable.
pub fn spawn_reachability_probe(
    ctx: PollContext,
    logical: Arc<LogicalAppliance>,
    node: Arc<PhysicalAppliance>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if node.is_reachable() {
                continue;
            }
            match bootstrap(&ctx, &logical, &node).await {
                Ok(()) => info!("Appliance {} bootstrapped as {}", node.host, node.router_name()),
                Err(e) => {
                    if e.is_unreachable() {
                        debug!("Appliance {} still unreachable: {}", node.host, e);
                    }
                }
            }
        }
    })
}

/// Probe plus one task per scheduled poller, for every node of `logical`.
pub fn spawn_appliance(
    ctx: &PollContext,
    logical: &Arc<LogicalAppliance>,
    reachability_retry: Duration,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for node in logical.nodes() {
        handles.push(spawn_reachability_probe(
            ctx.clone(),
            logical.clone(),
            node.clone(),
            reachability_retry,
            shutdown.clone(),
        ));
        for scheduled in &logical.pollers {
            handles.push(spawn_poller_task(
                ctx.clone(),
                logical.clone(),
                node.clone(),
                scheduled.clone(),
                shutdown.clone(),
            ));
        }
    }
    info!("Scheduled {} pollers on {} nodes of {}", logical.pollers.len(), logical.nodes().len(), logical.name);
    handles
}
