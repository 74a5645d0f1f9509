//! Service-registry adapter
//!
//! Mirrors the membership held by an external service registry (Consul,
//! Nacos, a mesh control plane). The registry connection parameters are
//! kept here so a client for the concrete registry can be layered on top;
//! membership arrives through [`RegistryDiscovery::update_services`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::endpoints::EndpointSet;
use super::{ServiceDiscovery, ServiceInstance, WatchStream};
use crate::error::{Error, Result};

/// Registry-backed discovery.
pub struct RegistryDiscovery {
    address: String,
    token: Option<String>,
    endpoints: EndpointSet,
}

impl std::fmt::Debug for RegistryDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryDiscovery")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl RegistryDiscovery {
    /// Create an adapter for the registry at `address`.
    pub fn new(address: impl Into<String>, token: Option<String>) -> Result<Self> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "registry address is required".to_string(),
            ));
        }
        Ok(Self {
            address,
            token: token.filter(|t| !t.is_empty()),
            endpoints: EndpointSet::new(),
        })
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Replace the registered instances of a service and notify watchers.
    pub fn update_services(&self, service_name: &str, instances: Vec<ServiceInstance>) {
        tracing::debug!(
            registry = %self.address,
            service = %service_name,
            instances = instances.len(),
            "Registry membership updated"
        );
        self.endpoints.replace(service_name, instances);
    }
}

#[async_trait]
impl ServiceDiscovery for RegistryDiscovery {
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.endpoints.discover(service_name)
    }

    async fn register(&self, instance: ServiceInstance) -> Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_requires_address() {
        assert!(matches!(
            RegistryDiscovery::new("  ", None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_token_is_none() {
        let disc = RegistryDiscovery::new("consul:8500", Some(String::new())).unwrap();
        assert_eq!(disc.token(), None);

        let disc = RegistryDiscovery::new("consul:8500", Some("s3cr3t".into())).unwrap();
        assert_eq!(disc.token(), Some("s3cr3t"));
        assert!(!format!("{disc:?}").contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_update_services_pushes_snapshot() {
        let disc = RegistryDiscovery::new("consul:8500", None).unwrap();
        let mut stream = disc.watch("tools", CancellationToken::new()).await.unwrap();

        disc.update_services(
            "tools",
            vec![
                ServiceInstance::new("a", "tools", "10.2.0.1", 7000),
                ServiceInstance::new("b", "tools", "10.2.0.2", 7000).with_healthy(false),
            ],
        );

        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(disc.discover("tools").await.unwrap().len(), 1);
    }
}
