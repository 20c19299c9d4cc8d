//! Call-outs to the metrics collaborator.
//!
//! The middle layer reports every successful send, every decoded inbound
//! message and the size of every outbound packet, labelled with the reporting
//! node's identifier. How those numbers are aggregated is up to the sink.
//!
//! [`InMemoryMetrics`] accumulates per-node counters with atomics and is what
//! tests and the `netbed` binary use to inspect a finished run.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::message::Identifier;

pub trait MetricsSink: Send + Sync + 'static {
    fn message_sent(&self, node: Identifier);

    fn message_received(&self, node: Identifier);

    fn packet_size(&self, _node: Identifier, _bytes: usize) {}

    /// Totals across every node, for sinks that keep them.
    fn snapshot(&self) -> Option<NodeMetrics> {
        None
    }
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn message_sent(&self, _node: Identifier) {}

    fn message_received(&self, _node: Identifier) {}
}

#[derive(Debug, Default)]
struct NodeCounters {
    sent: AtomicU64,
    received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl NodeCounters {
    fn snapshot(&self) -> NodeMetrics {
        NodeMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point in time view of one node's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeMetrics {
    pub sent: u64,
    pub received: u64,
    pub bytes_sent: u64,
}

impl std::ops::AddAssign for NodeMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.sent += rhs.sent;
        self.received += rhs.received;
        self.bytes_sent += rhs.bytes_sent;
    }
}

/// Lock-free per-node counters.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    nodes: DashMap<Identifier, NodeCounters>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters(&self, node: Identifier, f: impl FnOnce(&NodeCounters)) {
        if let Some(counters) = self.nodes.get(&node) {
            f(&counters);
            return;
        }
        f(&self.nodes.entry(node).or_default());
    }

    pub fn node(&self, node: &Identifier) -> NodeMetrics {
        self.nodes
            .get(node)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub fn total(&self) -> NodeMetrics {
        let mut total = NodeMetrics::default();
        for entry in self.nodes.iter() {
            total += entry.value().snapshot();
        }
        total
    }
}

impl MetricsSink for InMemoryMetrics {
    fn message_sent(&self, node: Identifier) {
        self.with_counters(node, |c| {
            c.sent.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn message_received(&self, node: Identifier) {
        self.with_counters(node, |c| {
            c.received.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn packet_size(&self, node: Identifier, bytes: usize) {
        self.with_counters(node, |c| {
            c.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        });
    }

    fn snapshot(&self) -> Option<NodeMetrics> {
        Some(self.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_per_node() {
        let metrics = InMemoryMetrics::new();
        let a = Identifier::from(1u128);
        let b = Identifier::from(2u128);

        metrics.message_sent(a);
        metrics.packet_size(a, 40);
        metrics.message_received(b);
        metrics.message_received(b);

        assert_eq!(
            metrics.node(&a),
            NodeMetrics {
                sent: 1,
                received: 0,
                bytes_sent: 40
            }
        );
        assert_eq!(metrics.node(&b).received, 2);
        assert_eq!(metrics.total().received, 2);
        assert_eq!(metrics.snapshot(), Some(metrics.total()));
        assert_eq!(NoopMetrics.snapshot(), None);
        assert_eq!(metrics.node(&Identifier::from(3u128)), NodeMetrics::default());
    }
}
