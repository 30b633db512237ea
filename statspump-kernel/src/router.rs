//! Destination routing.
//!
//! [`route`] puts a message on the queue of every bus its destination class
//! selects; the bus worker later asks [`resolve_targets`] which VPNs of that
//! bus the message is published into.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::appliance::PhysicalAppliance;
use crate::bus::{BusKind, MessageBus, RESERVED_VPN_MARKER};
use crate::error::Result;
use crate::message::StatsMessage;

/// Buses of the owning appliance a message goes to.
///
/// Grouped messages only reach buses configured for grouped traffic; the
/// individual records of a grouped poller skip those buses.
pub fn select_buses(msg: &StatsMessage) -> Vec<Arc<MessageBus>> {
    msg.logical
        .buses_for(msg.destination())
        .into_iter()
        .filter(|bus| {
            if msg.grouped {
                bus.grouped
            } else {
                !(bus.grouped && msg.poller.grouped)
            }
        })
        .collect()
}

/// Enqueues on every selected bus, waiting for room when a queue is full.
/// Returns the number of buses the message was queued on.
pub async fn route(msg: &Arc<StatsMessage>) -> Result<usize> {
    let buses = select_buses(msg);
    for bus in &buses {
        trace!("Routing {:?} to {}", msg, bus.name);
        bus.queue().enqueue(msg.clone()).await?;
    }
    Ok(buses.len())
}

/// Same as [`route`] for the decoder thread.
pub fn route_blocking(msg: &Arc<StatsMessage>) -> Result<usize> {
    let buses = select_buses(msg);
    for bus in &buses {
        trace!("Routing {:?} to {}", msg, bus.name);
        bus.queue().enqueue_blocking(msg.clone())?;
    }
    Ok(buses.len())
}

/// Whether a bus publishing back into origin VPNs may publish into `vpn`.
pub fn accepts_vpn(bus: &MessageBus, origin: &PhysicalAppliance, vpn: &str) -> bool {
    if !origin.is_active_vpn(vpn) {
        debug!("{}: VPN {} is not enabled/operational on {}, skipping", bus.name, vpn, origin.host);
        return false;
    }
    if vpn.starts_with(RESERVED_VPN_MARKER) {
        trace!("{}: VPN {} is reserved, skipping", bus.name, vpn);
        return false;
    }
    if !bus.exceptions.is_allowed(vpn) {
        debug!("{}: VPN {} excluded by exception rules", bus.name, vpn);
        return false;
    }
    true
}

/// VPNs of `bus` the message is published into. Local buses have none.
pub fn resolve_targets(bus: &MessageBus, msg: &StatsMessage) -> Vec<String> {
    match bus.kind {
        BusKind::Local => Vec::new(),
        BusKind::Mgmt => match &bus.vpn {
            Some(vpn) => vec![vpn.clone()],
            None => {
                warn!("Management bus {} has no VPN, dropping {:?}", bus.name, msg);
                Vec::new()
            }
        },
        BusKind::SelfVpn => {
            if let Some(fixed) = &bus.vpn {
                return vec![fixed.clone()];
            }
            match &msg.vpn {
                Some(vpn) => {
                    if accepts_vpn(bus, &msg.origin, vpn) {
                        vec![vpn.clone()]
                    } else {
                        Vec::new()
                    }
                }
                None => msg
                    .origin
                    .active_vpns()
                    .into_iter()
                    .filter(|vpn| accepts_vpn(bus, &msg.origin, vpn))
                    .filter(|vpn| {
                        let duplicate = msg.logical.has_matching_mgmt_bus(&bus.host, vpn);
                        if duplicate {
                            trace!("{}: VPN {} already reached by a management bus", bus.name, vpn);
                        }
                        !duplicate
                    })
                    .collect(),
            }
        }
    }
}
