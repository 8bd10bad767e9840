//! Per-topic traffic counters for one machine.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

/// Accumulated stats for a single topic.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TopicMetrics {
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// Collects inbound traffic per topic. Snapshots are cheap clones.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    topics: Mutex<HashMap<String, TopicMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one received message.
    pub fn record(&self, topic: &str, bytes: usize) {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        entry.total_messages += 1;
        entry.total_bytes += bytes as u64;
    }

    pub fn snapshot(&self) -> HashMap<String, TopicMetrics> {
        self.topics.lock().clone()
    }

    pub fn total_messages(&self) -> u64 {
        self.topics.lock().values().map(|t| t.total_messages).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_topic() {
        let m = MetricsCollector::new();
        m.record("locks.signal_ready", 10);
        m.record("locks.signal_ready", 6);
        m.record("engine.gather", 100);

        let snap = m.snapshot();
        assert_eq!(snap["locks.signal_ready"].total_messages, 2);
        assert_eq!(snap["locks.signal_ready"].total_bytes, 16);
        assert_eq!(snap["engine.gather"].total_messages, 1);
        assert_eq!(m.total_messages(), 3);
    }
}
