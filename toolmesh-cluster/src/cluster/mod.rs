//! Load-balanced, health-checked fleet of tool hosts
//!
//! A [`Cluster`] tracks every instance of one logical service as a
//! [`ClusterNode`], picks a healthy node per call, and fails over to another
//! node when a call fails. Two background tasks run while the cluster is
//! started: the health monitor and the discovery watch. Both only touch the
//! shared node table.

mod balancer;
mod health;
mod node;
mod table;
mod transport;
mod watch;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterSettings;
use crate::discovery::{ServiceDiscovery, ServiceInstance};
use crate::error::{Error, Result};
use crate::transport::{GrpcTransportFactory, TlsPolicy, TransportFactory};

use balancer::LoadBalancer;
use health::HealthProbeConfig;
use table::NodeTable;

pub use balancer::LoadBalancingStrategy;
pub use node::{ClusterNode, NodeSnapshot, NodeState};
pub use transport::ClusterTransport;

/// Everything a [`Cluster`] needs, validated by [`Cluster::new`].
#[derive(Clone)]
pub struct ClusterConfig {
    pub service_name: String,
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub strategy: LoadBalancingStrategy,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// Consecutive failures that turn a healthy node unhealthy.
    pub max_failures: u32,
    /// Total attempts per call, the first one included.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Per-attempt bound on a forwarded call.
    pub request_timeout: Option<Duration>,
}

impl std::fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("service_name", &self.service_name)
            .field("strategy", &self.strategy)
            .field("health_check_interval", &self.health_check_interval)
            .field("health_check_timeout", &self.health_check_timeout)
            .field("max_failures", &self.max_failures)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl ClusterConfig {
    /// Defaults match [`ClusterSettings::default`].
    pub fn new(
        service_name: impl Into<String>,
        discovery: Arc<dyn ServiceDiscovery>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let defaults = ClusterSettings::default();
        Self {
            service_name: service_name.into(),
            discovery,
            transport_factory,
            strategy: defaults.strategy,
            health_check_interval: defaults.health_check_interval,
            health_check_timeout: defaults.health_check_timeout,
            max_failures: defaults.max_failures,
            retry_attempts: defaults.retry_attempts,
            retry_delay: defaults.retry_delay,
            request_timeout: Some(defaults.request_timeout),
        }
    }

    /// Build the discovery backend and a gRPC transport factory from
    /// settings. TLS material is loaded here, not on first use.
    pub fn from_settings(settings: &ClusterSettings) -> Result<Self> {
        let discovery = settings.discovery.build()?;
        let tls = TlsPolicy::from_settings(&settings.tls)?;
        let factory = GrpcTransportFactory::new(tls, settings.connect_timeout);
        Ok(Self {
            service_name: settings.service_name.clone(),
            discovery,
            transport_factory: Arc::new(factory),
            strategy: settings.strategy,
            health_check_interval: settings.health_check_interval,
            health_check_timeout: settings.health_check_timeout,
            max_failures: settings.max_failures,
            retry_attempts: settings.retry_attempts,
            retry_delay: settings.retry_delay,
            request_timeout: (!settings.request_timeout.is_zero())
                .then_some(settings.request_timeout),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(Error::InvalidArgument("service name is empty".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(Error::InvalidArgument(
                "retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_failures == 0 {
            return Err(Error::InvalidArgument(
                "max_failures must be at least 1".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "health_check_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// State reachable from the background tasks.
pub(crate) struct Shared {
    config: ClusterConfig,
    nodes: RwLock<NodeTable>,
    balancer: LoadBalancer,
}

impl Shared {
    fn service_name(&self) -> &str {
        &self.config.service_name
    }

    fn discovery(&self) -> Arc<dyn ServiceDiscovery> {
        self.config.discovery.clone()
    }

    const fn probe_config(&self) -> HealthProbeConfig {
        HealthProbeConfig {
            interval: self.config.health_check_interval,
            timeout: self.config.health_check_timeout,
            failure_threshold: self.config.max_failures,
        }
    }

    fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.nodes.read().nodes()
    }

    fn new_node(&self, instance: ServiceInstance) -> Arc<ClusterNode> {
        Arc::new(ClusterNode::new(
            instance,
            self.config.transport_factory.clone(),
        ))
    }

    fn upsert(&self, table: &mut NodeTable, instance: ServiceInstance) {
        match table.get(&instance.id) {
            Some(node) => node.replace_instance(instance),
            None => {
                let node = self.new_node(instance);
                tracing::info!(
                    service = %self.service_name(),
                    node_id = %node.id(),
                    endpoint = %node.endpoint(),
                    state = %node.state(),
                    "Node added"
                );
                table.insert(node);
            }
        }
    }

    /// Add or refresh `instances` without evicting anyone.
    fn merge(&self, instances: Vec<ServiceInstance>) {
        let mut table = self.nodes.write();
        for instance in valid_instances(instances) {
            self.upsert(&mut table, instance);
        }
    }

    /// Make the table match a full membership snapshot.
    async fn reconcile(&self, snapshot: Vec<ServiceInstance>) {
        let instances = valid_instances(snapshot);
        let present: HashSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();

        let removed = {
            let mut table = self.nodes.write();
            let stale: Vec<String> = table
                .ids()
                .into_iter()
                .filter(|id| !present.contains(id.as_str()))
                .collect();
            let removed: Vec<_> = stale.iter().filter_map(|id| table.remove(id)).collect();
            for node in &removed {
                node.mark_removed();
            }
            for instance in instances.iter().cloned() {
                self.upsert(&mut table, instance);
            }
            removed
        };

        for node in removed {
            tracing::info!(
                service = %self.service_name(),
                node_id = %node.id(),
                "Node removed (no longer discovered)"
            );
            node.close().await;
        }
    }
}

fn valid_instances(instances: Vec<ServiceInstance>) -> Vec<ServiceInstance> {
    let mut seen = HashSet::new();
    instances
        .into_iter()
        .filter(|instance| match instance.validate() {
            Ok(()) => seen.insert(instance.id.clone()),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid discovered instance");
                false
            }
        })
        .collect()
}

enum Lifecycle {
    Idle,
    Running {
        health: JoinHandle<()>,
        watch: JoinHandle<()>,
    },
    Stopped,
}

/// Load-balanced client over every instance of one service.
pub struct Cluster {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("service_name", &self.shared.config.service_name)
            .field("strategy", &self.shared.balancer.strategy())
            .field("nodes", &self.node_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let balancer = LoadBalancer::new(config.strategy);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                nodes: RwLock::new(NodeTable::default()),
                balancer,
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_settings(settings: &ClusterSettings) -> Result<Self> {
        Self::new(ClusterConfig::from_settings(settings)?)
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        self.shared.service_name()
    }

    #[must_use]
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.shared.balancer.strategy()
    }

    /// Load the initial membership and launch the background tasks.
    ///
    /// A second call while running is a no-op. A stopped cluster cannot be
    /// restarted.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => {
                return Err(Error::unavailable(format!(
                    "cluster for service {} has been stopped",
                    self.service_name()
                )));
            }
            Lifecycle::Idle => {}
        }

        let instances = self
            .shared
            .config
            .discovery
            .discover(self.service_name())
            .await?;
        self.shared.merge(instances);

        let health = tokio::spawn(health::run(self.shared.clone(), self.cancel.clone()));
        let watch = tokio::spawn(watch::run(self.shared.clone(), self.cancel.clone()));
        *lifecycle = Lifecycle::Running { health, watch };

        tracing::info!(
            service = %self.service_name(),
            nodes = self.node_count(),
            strategy = %self.strategy(),
            "Cluster started"
        );
        Ok(())
    }

    /// Cancel the background tasks and close every node transport.
    /// Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
        self.cancel.cancel();

        if let Lifecycle::Running { health, watch } = previous {
            for (task, handle) in [("health", health), ("watch", watch)] {
                if let Err(e) = handle.await {
                    tracing::warn!(task, error = %e, "Cluster background task ended abnormally");
                }
            }
            tracing::info!(service = %self.service_name(), "Cluster stopped");
        }

        for node in self.shared.nodes() {
            node.close().await;
        }
        Ok(())
    }

    /// Track an instance by hand. Known ids are left untouched.
    pub fn register_node(&self, instance: ServiceInstance) -> Result<()> {
        instance.validate()?;
        let mut table = self.shared.nodes.write();
        if table.contains(&instance.id) {
            tracing::debug!(node_id = %instance.id, "Node already registered");
            return Ok(());
        }
        let node = self.shared.new_node(instance);
        tracing::info!(
            service = %self.service_name(),
            node_id = %node.id(),
            endpoint = %node.endpoint(),
            "Node registered"
        );
        table.insert(node);
        Ok(())
    }

    /// Stop tracking a node and close its transport.
    pub async fn deregister_node(&self, id: &str) -> Result<()> {
        let node = {
            let mut table = self.shared.nodes.write();
            let node = table
                .remove(id)
                .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
            node.mark_removed();
            node
        };
        tracing::info!(service = %self.service_name(), node_id = %id, "Node deregistered");
        node.close().await;
        Ok(())
    }

    /// Take a node out of rotation without removing it.
    pub fn drain_node(&self, id: &str) -> Result<()> {
        let node = self
            .node(id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        node.set_state(NodeState::Draining);
        Ok(())
    }

    /// Select a healthy node with the configured strategy.
    pub fn get_node(&self) -> Result<Arc<ClusterNode>> {
        self.select(&[])
    }

    #[must_use]
    pub fn healthy_nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.shared.nodes.read().healthy()
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<ClusterNode>> {
        self.shared.nodes()
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<Arc<ClusterNode>> {
        self.shared.nodes.read().get(id)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.shared.nodes.read().len()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes().iter().map(|n| n.snapshot()).collect()
    }

    /// Run one probe cycle now, outside the background schedule.
    pub async fn check_health(&self) {
        health::probe_nodes(&self.shared.nodes(), self.shared.probe_config()).await;
    }

    /// Forward a call to a healthy node, failing over on retryable errors.
    pub async fn send(&self, method: &str, params: Json) -> Result<Json> {
        self.send_with_cancel(&CancellationToken::new(), method, params)
            .await
    }

    /// [`send`](Self::send), aborted with `Cancelled` when `cancel` fires.
    pub async fn send_with_cancel(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Json,
    ) -> Result<Json> {
        let config = &self.shared.config;
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<Error> = None;

        for attempt in 1..=config.retry_attempts {
            if attempt > 1 {
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = self.cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(config.retry_delay) => {}
                }
            }

            let node = match self.select(&tried) {
                Ok(node) => node,
                Err(e) => {
                    return Err(match last_error {
                        Some(last) => Error::unavailable_with(
                            format!(
                                "no healthy nodes left for service {} after {} attempt(s)",
                                config.service_name,
                                attempt - 1
                            ),
                            last,
                        ),
                        None => e,
                    });
                }
            };

            match self.attempt(&node, cancel, method, params.clone()).await {
                Ok(result) => {
                    node.record_success();
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    node.record_failure(config.max_failures);
                    tracing::debug!(
                        node_id = %node.id(),
                        method,
                        attempt,
                        error = %e,
                        "Call failed, failing over"
                    );
                    tried.push(node.id().to_string());
                    last_error = Some(e);
                    if self.healthy_nodes().is_empty() {
                        break;
                    }
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| Error::unavailable("no attempt was made"));
        Err(Error::unavailable_with(
            format!(
                "call {method} to service {} failed on every attempt",
                config.service_name
            ),
            last,
        ))
    }

    /// Pick among healthy nodes, preferring ones not in `tried`.
    fn select(&self, tried: &[String]) -> Result<Arc<ClusterNode>> {
        let healthy = self.healthy_nodes();
        if healthy.is_empty() {
            return Err(Error::unavailable(format!(
                "no healthy nodes for service {}",
                self.service_name()
            )));
        }
        let fresh: Vec<_> = healthy
            .iter()
            .filter(|n| !tried.iter().any(|id| id == n.id()))
            .cloned()
            .collect();
        let candidates = if fresh.is_empty() { &healthy } else { &fresh };
        self.shared.balancer.select(candidates).ok_or_else(|| {
            Error::unavailable(format!(
                "no healthy nodes for service {}",
                self.service_name()
            ))
        })
    }

    async fn attempt(
        &self,
        node: &Arc<ClusterNode>,
        cancel: &CancellationToken,
        method: &str,
        params: Json,
    ) -> Result<Json> {
        // A stopped cluster must not lazily reopen node transports.
        if cancel.is_cancelled() || self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _in_flight = node.acquire();
        let transport = node.transport()?;
        let call = async {
            match self.shared.config.request_timeout {
                Some(limit) => tokio::time::timeout(limit, transport.send(method, params))
                    .await
                    .map_err(|_| {
                        Error::DeadlineExceeded(format!(
                            "{method} on node {} timed out after {limit:?}",
                            node.id()
                        ))
                    })?,
                None => transport.send(method, params).await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            result = call => result,
        }
    }
}
