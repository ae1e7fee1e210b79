//! Heartbeat timeout detection
//!
//! Node agents push heartbeats; this task sweeps the registry on every
//! heartbeat interval and marks nodes that have been silent for
//! `missed_heartbeats` intervals as unreachable.

use crate::cluster::registry::NodeRegistry;
use crate::common::timestamp_now_millis;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct HeartbeatDetector {
    registry: Arc<NodeRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatDetector {
    pub fn new(registry: Arc<NodeRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    /// One sweep at `now_ms`; returns nodes newly marked unreachable
    pub fn sweep_at(&self, now_ms: u64) -> Vec<String> {
        self.registry.expire_stale(now_ms, self.timeout)
    }

    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(timestamp_now_millis())
    }

    /// Run until `shutdown` flips to true
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = self.interval.as_millis() as u64,
                timeout_ms = self.timeout.as_millis() as u64,
                "Heartbeat detector started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = self.sweep();
                        if !expired.is_empty() {
                            tracing::debug!(nodes = ?expired, "Sweep marked nodes unreachable");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Heartbeat detector stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{NodeHealth, NodeTag};

    #[test]
    fn test_sweep_after_missed_heartbeats() {
        let registry = Arc::new(NodeRegistry::new());
        registry.register_node("a", [NodeTag::Voter], 0).unwrap();
        registry.register_node("b", [NodeTag::Voter], 0).unwrap();

        let base = u64::MAX / 4;
        registry.record_heartbeat("a", base).unwrap();
        registry.record_heartbeat("b", base).unwrap();

        let detector = HeartbeatDetector::new(
            registry.clone(),
            Duration::from_secs(1),
            Duration::from_secs(3),
        );

        registry.record_heartbeat("a", base + 2_500).unwrap();
        assert!(detector.sweep_at(base + 2_900).is_empty());

        let expired = detector.sweep_at(base + 3_100);
        assert_eq!(expired, vec!["b".to_string()]);
        assert_eq!(registry.get("b").unwrap().health, NodeHealth::Unreachable);
        assert_eq!(registry.get("a").unwrap().health, NodeHealth::Ready);
    }
}
