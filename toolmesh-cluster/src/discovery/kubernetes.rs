//! Kubernetes endpoint adapter
//!
//! Tracks the endpoints of services inside one namespace. The surrounding
//! system (an informer, an operator, a sidecar) pushes fresh endpoint
//! snapshots through [`KubernetesDiscovery::update_endpoints`]; watchers of
//! the service receive them as membership snapshots.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::endpoints::EndpointSet;
use super::{ServiceDiscovery, ServiceInstance, WatchStream};
use crate::error::{Error, Result};

/// Metadata key carrying the namespace an instance was observed in.
pub const NAMESPACE_METADATA_KEY: &str = "namespace";

/// Endpoint-backed discovery scoped to one namespace.
pub struct KubernetesDiscovery {
    namespace: String,
    endpoints: EndpointSet,
}

impl KubernetesDiscovery {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            endpoints: EndpointSet::new(),
        }
    }

    /// Create from the pod's downward-API environment (`POD_NAMESPACE`).
    pub fn from_env() -> Result<Self> {
        let namespace = std::env::var("POD_NAMESPACE").map_err(|_| {
            Error::Configuration(
                "POD_NAMESPACE env var is required for kubernetes discovery".to_string(),
            )
        })?;
        Ok(Self::new(namespace))
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Replace the endpoint set of a service and notify watchers.
    pub fn update_endpoints(&self, service_name: &str, instances: Vec<ServiceInstance>) {
        let instances = instances
            .into_iter()
            .map(|i| self.stamp(i))
            .collect::<Vec<_>>();
        tracing::debug!(
            namespace = %self.namespace,
            service = %service_name,
            endpoints = instances.len(),
            "Kubernetes endpoints updated"
        );
        self.endpoints.replace(service_name, instances);
    }

    fn stamp(&self, instance: ServiceInstance) -> ServiceInstance {
        if instance.metadata.contains_key(NAMESPACE_METADATA_KEY) {
            instance
        } else {
            instance.with_metadata(NAMESPACE_METADATA_KEY, self.namespace.clone())
        }
    }
}

#[async_trait]
impl ServiceDiscovery for KubernetesDiscovery {
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.endpoints.discover(service_name)
    }

    async fn register(&self, instance: ServiceInstance) -> Result<()> {
        let instance = self.stamp(instance);
        self.endpoints.register(instance)
    }

    async fn deregister(&self, instance_id: &str) -> Result<()> {
        self.endpoints.deregister(instance_id)
    }

    async fn watch(&self, service_name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        Ok(self.endpoints.watch(service_name, cancel))
    }

    async fn close(&self) -> Result<()> {
        self.endpoints.close();
        Ok(())
    }
}
