//! Tracked cluster node

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::discovery::ServiceInstance;
use crate::error::Result;
use crate::transport::{Transport, TransportFactory};

/// Health state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Healthy,
    Unhealthy,
    /// Finishing in-flight work; never selected, never revived by probes.
    Draining,
    /// Terminal. The node has left the table.
    Removed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Draining => "draining",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Health {
    state: NodeState,
    failure_count: u32,
    last_health_check: Option<DateTime<Utc>>,
}

/// Point-in-time view of a node for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub endpoint: String,
    pub state: NodeState,
    pub failure_count: u32,
    pub connections: usize,
    pub weight: i32,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// One instance plus the cluster's view of it.
///
/// State and failure count share one lock; the transport slot has its own;
/// the connection count is a bare atomic.
pub struct ClusterNode {
    id: String,
    instance: RwLock<ServiceInstance>,
    health: Mutex<Health>,
    connections: AtomicUsize,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    factory: Arc<dyn TransportFactory>,
}

impl fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClusterNode {
    pub(crate) fn new(instance: ServiceInstance, factory: Arc<dyn TransportFactory>) -> Self {
        let state = if instance.healthy {
            NodeState::Healthy
        } else {
            NodeState::Unhealthy
        };
        Self {
            id: instance.id.clone(),
            instance: RwLock::new(instance),
            health: Mutex::new(Health {
                state,
                failure_count: 0,
                last_health_check: None,
            }),
            connections: AtomicUsize::new(0),
            transport: Mutex::new(None),
            factory,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn instance(&self) -> ServiceInstance {
        self.instance.read().clone()
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        self.instance.read().endpoint()
    }

    #[must_use]
    pub fn weight(&self) -> u64 {
        self.instance.read().effective_weight()
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.health.lock().state
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state() == NodeState::Healthy
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.health.lock().failure_count
    }

    /// Calls currently in flight through this node.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.health.lock().last_health_check
    }

    /// Force the node into `state`. Marking a node healthy clears its
    /// failure count. A removed node stays removed.
    pub fn set_state(&self, state: NodeState) {
        let mut health = self.health.lock();
        if health.state == NodeState::Removed || health.state == state {
            return;
        }
        tracing::info!(
            node_id = %self.id,
            from = %health.state,
            to = %state,
            "Node state overridden"
        );
        health.state = state;
        if state == NodeState::Healthy {
            health.failure_count = 0;
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        let instance = self.instance.read();
        let health = self.health.lock();
        NodeSnapshot {
            id: self.id.clone(),
            endpoint: instance.endpoint(),
            state: health.state,
            failure_count: health.failure_count,
            connections: self.connections(),
            weight: instance.weight,
            last_health_check: health.last_health_check,
        }
    }

    /// Swap in a fresh instance value from discovery. A discovery-reported
    /// unhealthy flag marks the node unhealthy; a healthy flag changes
    /// nothing, recovery is left to the probe.
    pub(crate) fn replace_instance(&self, instance: ServiceInstance) {
        let flagged_unhealthy = !instance.healthy;
        *self.instance.write() = instance;
        if flagged_unhealthy {
            let mut health = self.health.lock();
            if health.state == NodeState::Healthy {
                tracing::warn!(node_id = %self.id, "Discovery reports node unhealthy");
                health.state = NodeState::Unhealthy;
            }
        }
    }

    pub(crate) fn record_success(&self) {
        self.health.lock().failure_count = 0;
    }

    /// Count a failed call; returns the resulting state.
    pub(crate) fn record_failure(&self, max_failures: u32) -> NodeState {
        let mut health = self.health.lock();
        health.failure_count = health.failure_count.saturating_add(1);
        if health.state == NodeState::Healthy && health.failure_count >= max_failures {
            tracing::warn!(
                node_id = %self.id,
                consecutive_failures = health.failure_count,
                "Node marked unhealthy after consecutive call failures"
            );
            health.state = NodeState::Unhealthy;
        }
        health.state
    }

    /// Apply one health-probe outcome; returns the resulting state.
    pub(crate) fn record_probe(&self, ok: bool, max_failures: u32) -> NodeState {
        let mut health = self.health.lock();
        health.last_health_check = Some(Utc::now());
        if ok {
            health.failure_count = 0;
            if health.state == NodeState::Unhealthy {
                tracing::info!(node_id = %self.id, "Node recovered (probe)");
                health.state = NodeState::Healthy;
            }
        } else {
            health.failure_count = health.failure_count.saturating_add(1);
            if health.state == NodeState::Healthy && health.failure_count >= max_failures {
                tracing::warn!(
                    node_id = %self.id,
                    consecutive_failures = health.failure_count,
                    "Node marked unhealthy after consecutive probe failures"
                );
                health.state = NodeState::Unhealthy;
            }
        }
        health.state
    }

    pub(crate) fn mark_removed(&self) {
        self.health.lock().state = NodeState::Removed;
    }

    /// Track one in-flight call until the guard drops.
    pub(crate) fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard { node: self.clone() }
    }

    /// The node's transport, created on first use.
    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>> {
        let mut slot = self.transport.lock();
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }
        let instance = self.instance.read().clone();
        let transport = self.factory.create(&instance)?;
        *slot = Some(transport.clone());
        Ok(transport)
    }

    pub(crate) async fn probe(&self, timeout: Duration) -> Result<()> {
        self.transport()?.probe(timeout).await
    }

    /// Close and drop the owned transport, if any.
    pub(crate) async fn close(&self) {
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::debug!(node_id = %self.id, error = %e, "Error closing node transport");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn has_transport(&self) -> bool {
        self.transport.lock().is_some()
    }
}

/// Decrements the node's connection count on drop.
pub(crate) struct ConnectionGuard {
    node: Arc<ClusterNode>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.node.connections.fetch_sub(1, Ordering::AcqRel);
    }
}
