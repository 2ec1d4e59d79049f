use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracked per Session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    NodesStarted,
    NodesExecuted,
    NodesCacheHits,
    NodesCleaned,
    CyclesDetected,
    ProcessCacheHits,
    ProcessLocalExecutions,
    ProcessRemoteExecutions,
    RemoteRetries,
    RemoteFallbacks,
    ProcessTimeouts,
}

impl Metric {
    pub const ALL: [Metric; 11] = [
        Metric::NodesStarted,
        Metric::NodesExecuted,
        Metric::NodesCacheHits,
        Metric::NodesCleaned,
        Metric::CyclesDetected,
        Metric::ProcessCacheHits,
        Metric::ProcessLocalExecutions,
        Metric::ProcessRemoteExecutions,
        Metric::RemoteRetries,
        Metric::RemoteFallbacks,
        Metric::ProcessTimeouts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::NodesStarted => "nodes_started",
            Metric::NodesExecuted => "nodes_executed",
            Metric::NodesCacheHits => "nodes_cache_hits",
            Metric::NodesCleaned => "nodes_cleaned",
            Metric::CyclesDetected => "cycles_detected",
            Metric::ProcessCacheHits => "process_cache_hits",
            Metric::ProcessLocalExecutions => "process_local_executions",
            Metric::ProcessRemoteExecutions => "process_remote_executions",
            Metric::RemoteRetries => "remote_retries",
            Metric::RemoteFallbacks => "remote_fallbacks",
            Metric::ProcessTimeouts => "process_timeouts",
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    counters: [AtomicU64; Metric::ALL.len()],
}

impl Metrics {
    pub fn record(&self, metric: Metric) {
        self.counters[metric as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counters[metric as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        Metric::ALL
            .iter()
            .map(|metric| (metric.as_str().to_string(), self.get(*metric)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_names_every_counter() {
        let metrics = Metrics::default();
        metrics.record(Metric::NodesExecuted);
        metrics.record(Metric::NodesExecuted);
        metrics.record(Metric::RemoteRetries);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), Metric::ALL.len());
        assert_eq!(snapshot["nodes_executed"], 2);
        assert_eq!(snapshot["remote_retries"], 1);
        assert_eq!(snapshot["process_timeouts"], 0);
    }
}
