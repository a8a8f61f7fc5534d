//! Cluster metrics
//!
//! Counters are bumped by the server's request paths and background tasks;
//! consensus gauges are read from the Raft status when rendering.

use crate::server::raft_node::{RaftRole, RaftStatus};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for tracking event counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics of one server node
#[derive(Debug, Default)]
pub struct ClusterMetrics {
    pub proposals_total: Counter,
    pub proposals_failed: Counter,
    pub queries_total: Counter,
    pub stale_reads: Counter,
    pub evictions_total: Counter,
    pub publish_failures: Counter,
}

impl ClusterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render in Prometheus text exposition format
    pub fn render(&self, status: &RaftStatus) -> String {
        let mut out = String::new();
        let counters = [
            ("minimeta_proposals_total", &self.proposals_total),
            ("minimeta_proposals_failed_total", &self.proposals_failed),
            ("minimeta_queries_total", &self.queries_total),
            ("minimeta_stale_reads_total", &self.stale_reads),
            ("minimeta_evictions_total", &self.evictions_total),
            ("minimeta_publish_failures_total", &self.publish_failures),
        ];
        for (name, counter) in counters {
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges = [
            ("minimeta_raft_term", status.term),
            ("minimeta_raft_commit_index", status.commit_index),
            ("minimeta_raft_last_applied", status.last_applied),
            ("minimeta_raft_last_log_index", status.last_log_index),
            ("minimeta_raft_snapshot_index", status.snapshot_index),
            ("minimeta_raft_members", status.members.len() as u64),
            (
                "minimeta_raft_is_leader",
                (status.role == RaftRole::Leader) as u64,
            ),
            ("minimeta_raft_faulted", status.faulted as u64),
        ];
        for (name, value) in gauges {
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_render() {
        let metrics = ClusterMetrics::new();
        metrics.proposals_total.add(3);
        metrics.evictions_total.inc();
        let status = RaftStatus {
            term: 7,
            role: RaftRole::Leader,
            ..RaftStatus::new("n1".into())
        };
        let text = metrics.render(&status);
        assert!(text.contains("minimeta_proposals_total 3"));
        assert!(text.contains("minimeta_evictions_total 1"));
        assert!(text.contains("minimeta_raft_term 7"));
        assert!(text.contains("minimeta_raft_is_leader 1"));
    }
}
