//! Health monitoring for cluster nodes
//!
//! Periodically probes every tracked node through its transport. Probe
//! outcomes only move node state; they are never surfaced to callers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::node::{ClusterNode, NodeState};
use super::Shared;

/// Probe settings shared by every cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HealthProbeConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

/// Run probe cycles until `cancel` fires.
pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let probe = shared.probe_config();
    let mut timer = interval(probe.interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!(service = %shared.service_name(), "Health monitor shutting down");
                return;
            }
            _ = timer.tick() => {
                let nodes = shared.nodes();
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = probe_nodes(&nodes, probe) => {}
                }
            }
        }
    }
}

/// Probe all `nodes` concurrently and apply the outcomes.
pub(crate) async fn probe_nodes(nodes: &[Arc<ClusterNode>], probe: HealthProbeConfig) {
    let targets: Vec<_> = nodes
        .iter()
        .filter(|n| n.state() != NodeState::Removed)
        .collect();

    let results = join_all(targets.iter().map(|node| async move {
        match node.probe(probe.timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    node_id = %node.id(),
                    endpoint = %node.endpoint(),
                    error = %e,
                    "Health probe failed"
                );
                false
            }
        }
    }))
    .await;

    for (node, ok) in targets.into_iter().zip(results) {
        node.record_probe(ok, probe.failure_threshold);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::discovery::ServiceInstance;
    use crate::error::{Error, Result};
    use crate::transport::{MockTransport, Transport, TransportFactory};

    fn probe() -> HealthProbeConfig {
        HealthProbeConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(50),
            failure_threshold: 2,
        }
    }

    fn node_with(up: Arc<AtomicBool>) -> Arc<ClusterNode> {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(move |_: &ServiceInstance| -> Result<Arc<dyn Transport>> {
                let up = up.clone();
                let mut mock = MockTransport::new();
                mock.expect_probe().returning(move |_| {
                    if up.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(Error::Transport("connection refused".into()))
                    }
                });
                Ok(Arc::new(mock))
            });
        Arc::new(ClusterNode::new(
            ServiceInstance::new("a", "tools", "10.0.0.1", 7000),
            factory,
        ))
    }

    #[tokio::test]
    async fn test_failing_probes_reach_threshold() {
        let up = Arc::new(AtomicBool::new(false));
        let node = node_with(up.clone());
        let nodes = vec![node.clone()];

        probe_nodes(&nodes, probe()).await;
        assert_eq!(node.state(), NodeState::Healthy);
        assert_eq!(node.failure_count(), 1);

        probe_nodes(&nodes, probe()).await;
        assert_eq!(node.state(), NodeState::Unhealthy);

        up.store(true, Ordering::SeqCst);
        probe_nodes(&nodes, probe()).await;
        assert_eq!(node.state(), NodeState::Healthy);
        assert_eq!(node.failure_count(), 0);
        assert!(node.last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_draining_and_removed_not_revived() {
        let up = Arc::new(AtomicBool::new(true));
        let draining = node_with(up.clone());
        draining.set_state(NodeState::Draining);
        let removed = node_with(up);
        removed.mark_removed();

        probe_nodes(&[draining.clone(), removed.clone()], probe()).await;
        assert_eq!(draining.state(), NodeState::Draining);
        assert_eq!(removed.state(), NodeState::Removed);
        assert!(removed.last_health_check().is_none());
    }
}
