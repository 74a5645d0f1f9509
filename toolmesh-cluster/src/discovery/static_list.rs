//! Static instance list
//!
//! In-memory membership seeded at construction. Useful for fixed fleets and
//! tests; it has no change source, so `watch` never emits.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::{empty_watch, healthy_only, ServiceDiscovery, ServiceInstance, WatchStream};
use crate::error::{Error, Result};

/// Static discovery backend, keyed by service name.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
}

impl StaticDiscovery {
    /// Seed with instances; each is filed under its own `name`.
    #[must_use]
    pub fn new(instances: Vec<ServiceInstance>) -> Self {
        let mut services: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        for instance in instances {
            let entries = services.entry(instance.name.clone()).or_default();
            entries.retain(|existing| existing.id != instance.id);
            entries.push(instance);
        }
        Self {
            services: RwLock::new(services),
        }
    }

    /// Declare a service with no instances yet, so `discover` returns an
    /// empty list instead of `NotFound`.
    #[must_use]
    pub fn with_service(self, service_name: &str) -> Self {
        self.services
            .write()
            .entry(service_name.to_string())
            .or_default();
        self
    }

    /// Flip the health flag of one instance.
    pub fn set_healthy(&self, instance_id: &str, healthy: bool) -> Result<()> {
        let mut services = self.services.write();
        for entries in services.values_mut() {
            if let Some(slot) = entries.iter_mut().find(|i| i.id == instance_id) {
                *slot = slot.clone().with_healthy(healthy);
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("instance {instance_id}")))
    }

    /// All instances of a service regardless of health.
    #[must_use]
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .read()
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let services = self.services.read();
        services
            .get(service_name)
            .map(|entries| healthy_only(entries))
            .ok_or_else(|| Error::NotFound(format!("service {service_name}")))
    }

    async fn register(&self, instance: ServiceInstance) -> Result<()> {
        instance.validate()?;
        let mut services = self.services.write();
        let entries = services.entry(instance.name.clone()).or_default();
        match entries.iter_mut().find(|i| i.id == instance.id) {
            Some(slot) => *slot = instance,
            None => entries.push(instance),
        }
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<()> {
        let mut services = self.services.write();
        for entries in services.values_mut() {
            if let Some(pos) = entries.iter().position(|i| i.id == instance_id) {
                entries.remove(pos);
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("instance {instance_id}")))
    }

    async fn watch(&self, _service_name: &str, _cancel: CancellationToken) -> Result<WatchStream> {
        Ok(empty_watch())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn seeded() -> StaticDiscovery {
        StaticDiscovery::new(vec![
            ServiceInstance::new("a", "tools", "10.0.0.1", 50051),
            ServiceInstance::new("b", "tools", "10.0.0.2", 50051),
            ServiceInstance::new("c", "tools", "10.0.0.3", 50051),
        ])
    }

    #[tokio::test]
    async fn test_discover_returns_healthy_instances() {
        let disc = seeded();
        let found = disc.discover("tools").await.unwrap();
        assert_eq!(found.len(), 3);

        disc.set_healthy("b", false).unwrap();
        let found = disc.discover("tools").await.unwrap();
        let ids: Vec<_> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        disc.set_healthy("b", true).unwrap();
        assert_eq!(disc.discover("tools").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let disc = seeded();
        assert!(matches!(
            disc.discover("other").await,
            Err(Error::NotFound(_))
        ));

        let disc = disc.with_service("other");
        assert!(disc.discover("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_same_id() {
        let disc = seeded();
        disc.register(ServiceInstance::new("a", "tools", "10.0.0.9", 9000))
            .await
            .unwrap();
        disc.register(ServiceInstance::new("a", "tools", "10.0.0.9", 9001))
            .await
            .unwrap();

        let all = disc.instances("tools");
        assert_eq!(all.len(), 3);
        let a = all.iter().find(|i| i.id == "a").unwrap();
        assert_eq!(a.port, 9001);
    }

    #[tokio::test]
    async fn test_register_rejects_empty_instance() {
        let disc = seeded();
        assert!(matches!(
            disc.register(ServiceInstance::new("", "tools", "10.0.0.9", 1)).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister() {
        let disc = seeded();
        disc.deregister("a").await.unwrap();
        assert_eq!(disc.discover("tools").await.unwrap().len(), 2);
        assert!(matches!(disc.deregister("a").await, Err(Error::NotFound(_))));
        assert!(matches!(disc.set_healthy("a", true), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_watch_never_emits() {
        let disc = seeded();
        let mut stream = disc.watch("tools", CancellationToken::new()).await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
