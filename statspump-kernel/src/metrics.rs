use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::state::{new_state, Shared};

/// Depth and high-water marks of one bus queue.
#[derive(Debug)]
pub struct QueueStats {
    pub name: String,
    pub capacity: usize,
    depth: AtomicUsize,
    high_water: AtomicUsize,
    current_high_water: AtomicUsize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    blocked: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub name: String,
    pub capacity: usize,
    pub depth: usize,
    pub high_water: usize,
    pub current_high_water: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub blocked: u64,
}

impl QueueStats {
    fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            depth: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            current_high_water: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self, depth: usize) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.depth.store(depth, Ordering::Relaxed);
        self.high_water.fetch_max(depth, Ordering::Relaxed);
        self.current_high_water.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self, depth: usize) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// A producer found the queue full and had to wait.
    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            name: self.name.clone(),
            capacity: self.capacity,
            depth: self.depth.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
            current_high_water: self.current_high_water.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }

    /// Starts a new reporting window for the current high-water mark.
    pub fn reset_current_high_water(&self) {
        self.current_high_water.store(self.depth(), Ordering::Relaxed);
    }
}

/// Every bus queue registers here and keeps the returned handle.
#[derive(Clone, Default)]
pub struct QueueMetricsRegistry {
    queues: Shared<Vec<Arc<QueueStats>>>,
}

impl QueueMetricsRegistry {
    pub fn new() -> Self {
        Self { queues: new_state(Vec::new()) }
    }

    pub fn register(&self, name: impl Into<String>, capacity: usize) -> Arc<QueueStats> {
        let stats = Arc::new(QueueStats::new(name.into(), capacity));
        self.queues.lock().push(stats.clone());
        stats
    }

    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        self.queues.lock().iter().map(|q| q.snapshot()).collect()
    }

    /// Snapshot, then reset every queue's current high-water mark.
    pub fn report_window(&self) -> Vec<QueueSnapshot> {
        let queues = self.queues.lock();
        queues
            .iter()
            .map(|q| {
                let snapshot = q.snapshot();
                q.reset_current_high_water();
                snapshot
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_high_water_marks() {
        let registry = QueueMetricsRegistry::new();
        let stats = registry.register("bus-a", 10);
        stats.record_enqueue(1);
        stats.record_enqueue(2);
        stats.record_enqueue(3);
        stats.record_dequeue(2);

        let window = registry.report_window();
        assert_eq!(window[0].high_water, 3);
        assert_eq!(window[0].current_high_water, 3);
        assert_eq!(window[0].depth, 2);

        let next = registry.snapshot();
        assert_eq!(next[0].high_water, 3);
        assert_eq!(next[0].current_high_water, 2);
        assert_eq!(next[0].enqueued, 3);
        assert_eq!(next[0].dequeued, 1);
    }
}
