//! In-process plugin statistics surfaced through the Info RPC.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug)]
pub struct Stats {
    started_at: DateTime<Utc>,
    collect_requests: AtomicU64,
    publish_requests: AtomicU64,
    metrics_collected: AtomicU64,
    metrics_filtered: AtomicU64,
    tasks_loaded: AtomicU64,
    tasks_unloaded: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            collect_requests: AtomicU64::new(0),
            publish_requests: AtomicU64::new(0),
            metrics_collected: AtomicU64::new(0),
            metrics_filtered: AtomicU64::new(0),
            tasks_loaded: AtomicU64::new(0),
            tasks_unloaded: AtomicU64::new(0),
        }
    }
}

impl Stats {
    pub fn inc_collect_requests(&self) {
        self.collect_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_publish_requests(&self) {
        self.publish_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_metrics_collected(&self) {
        self.metrics_collected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_metrics_filtered(&self) {
        self.metrics_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_loaded(&self) {
        self.tasks_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_unloaded(&self) {
        self.tasks_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            collect_requests: self.collect_requests.load(Ordering::Relaxed),
            publish_requests: self.publish_requests.load(Ordering::Relaxed),
            metrics_collected: self.metrics_collected.load(Ordering::Relaxed),
            metrics_filtered: self.metrics_filtered.load(Ordering::Relaxed),
            tasks_loaded: self.tasks_loaded.load(Ordering::Relaxed),
            tasks_unloaded: self.tasks_unloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub collect_requests: u64,
    pub publish_requests: u64,
    pub metrics_collected: u64,
    pub metrics_filtered: u64,
    pub tasks_loaded: u64,
    pub tasks_unloaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let stats = Stats::default();
        stats.inc_collect_requests();
        stats.inc_metrics_collected();
        stats.inc_metrics_collected();
        stats.inc_metrics_filtered();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.collect_requests, 1);
        assert_eq!(snapshot.metrics_collected, 2);
        assert_eq!(snapshot.metrics_filtered, 1);
        assert_eq!(snapshot.tasks_loaded, 0);
    }
}
