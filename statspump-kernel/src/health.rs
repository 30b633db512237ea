use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::metrics::QueueMetricsRegistry;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpHealthReport {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub appliances: u32,
    pub nodes_reachable: u32,
    pub nodes_total: u32,
    pub poll_cycles: u64,
    pub poll_failures: u64,
    pub requeries: u64,
    pub records_decoded: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub bus_queues: u32,
}

#[derive(Default)]
struct Counters {
    poll_cycles: AtomicU64,
    poll_failures: AtomicU64,
    requeries: AtomicU64,
    records_decoded: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

/// Process-wide counters shared by schedulers and bus workers.
#[derive(Clone)]
pub struct PumpHealth {
    start_time: Instant,
    counters: Arc<Counters>,
}

impl Default for PumpHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PumpHealth {
    pub fn new() -> Self {
        Self { start_time: Instant::now(), counters: Arc::new(Counters::default()) }
    }

    pub fn record_poll_cycle(&self) {
        self.counters.poll_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requery(&self) {
        self.counters.requeries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, records: usize) {
        self.counters.records_decoded.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.counters.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requeries(&self) -> u64 {
        self.counters.requeries.load(Ordering::Relaxed)
    }

    pub fn messages_published(&self) -> u64 {
        self.counters.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.counters.publish_failures.load(Ordering::Relaxed)
    }

    /// `nodes` is (reachable, total) across every appliance.
    pub fn get_health(&self, appliances: usize, nodes: (usize, usize), metrics: &QueueMetricsRegistry) -> PumpHealthReport {
        let c = &self.counters;
        PumpHealthReport {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            appliances: appliances as u32,
            nodes_reachable: nodes.0 as u32,
            nodes_total: nodes.1 as u32,
            poll_cycles: c.poll_cycles.load(Ordering::Relaxed),
            poll_failures: c.poll_failures.load(Ordering::Relaxed),
            requeries: c.requeries.load(Ordering::Relaxed),
            records_decoded: c.records_decoded.load(Ordering::Relaxed),
            messages_published: c.messages_published.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            bus_queues: metrics.len() as u32,
        }
    }
}

/// Logs every queue's depth and high-water marks, then opens a new window.
pub fn spawn_queue_reporter(
    metrics: QueueMetricsRegistry,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for queue in metrics.report_window() {
                        if queue.current_high_water >= queue.capacity {
                            warn!(
                                "Bus queue {} reached capacity {} (depth {}, blocked producers {})",
                                queue.name, queue.capacity, queue.depth, queue.blocked
                            );
                        } else {
                            info!(
                                "Bus queue {}: depth {}, window HWM {}, HWM {}/{}",
                                queue.name, queue.depth, queue.current_high_water, queue.high_water, queue.capacity
                            );
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Queue reporter stopping");
                    break;
                }
            }
        }
    })
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|kb| kb.parse::<u64>().ok()) {
                        return kb as f32 / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_report() {
        let health = PumpHealth::new();
        health.record_poll_cycle();
        health.record_poll_cycle();
        health.record_poll_failure();
        health.record_decoded(3);
        health.record_published();
        health.record_requery();

        let metrics = QueueMetricsRegistry::new();
        metrics.register("q", 4);
        let report = health.clone().get_health(1, (1, 2), &metrics);
        assert_eq!(report.poll_cycles, 2);
        assert_eq!(report.poll_failures, 1);
        assert_eq!(report.records_decoded, 3);
        assert_eq!(report.messages_published, 1);
        assert_eq!(report.requeries, 1);
        assert_eq!(report.nodes_reachable, 1);
        assert_eq!(report.nodes_total, 2);
        assert_eq!(report.bus_queues, 1);
    }
}
