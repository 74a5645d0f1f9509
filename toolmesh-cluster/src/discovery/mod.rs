//! Service discovery
//!
//! Resolves a logical service name to the set of reachable instances and,
//! where the backend can, pushes membership snapshots as they change.

pub mod dns;
pub mod endpoints;
pub mod kubernetes;
pub mod registry;
pub mod static_list;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use dns::{DnsDiscovery, DnsResolver, HickoryResolver, SrvTarget};
pub use kubernetes::KubernetesDiscovery;
pub use registry::RegistryDiscovery;
pub use static_list::StaticDiscovery;

/// Stream of full membership snapshots produced by [`ServiceDiscovery::watch`].
pub type WatchStream = BoxStream<'static, Vec<ServiceInstance>>;

/// One reachable replica of a logical service.
///
/// Discovery backends replace instances wholesale on update; an instance is
/// never mutated after it has been handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

const fn default_healthy() -> bool {
    true
}

const fn default_weight() -> i32 {
    1
}

impl ServiceInstance {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            healthy: true,
            weight: 1,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub const fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// "address:port", bracketing bare IPv6 addresses.
    #[must_use]
    pub fn endpoint(&self) -> String {
        host_port(&self.address, self.port)
    }

    /// Weight used by weighted selection; non-positive weights count as 1.
    #[must_use]
    pub const fn effective_weight(&self) -> u64 {
        if self.weight <= 0 {
            1
        } else {
            self.weight as u64
        }
    }

    /// Reject instances that cannot be addressed.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidArgument("instance id is empty".to_string()));
        }
        if self.address.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "instance {} has no address",
                self.id
            )));
        }
        Ok(())
    }
}

/// Pluggable discovery backend.
///
/// The cluster treats every implementation identically.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Instances of `service_name` currently believed healthy.
    ///
    /// Fails with `NotFound` when the backend does not know the service.
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>>;

    /// Announce an instance. Read-only backends return `Unsupported`.
    async fn register(&self, instance: ServiceInstance) -> Result<()>;

    /// Withdraw an instance. Fails with `NotFound` if it is not registered.
    async fn deregister(&self, instance_id: &str) -> Result<()>;

    /// Full membership snapshots of `service_name`, emitted whenever a
    /// change is observed. The stream ends when `cancel` fires. Backends
    /// without a change source return an empty stream.
    async fn watch(&self, service_name: &str, cancel: CancellationToken) -> Result<WatchStream>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;
}

/// Join a host and port, bracketing bare IPv6 addresses.
#[must_use]
pub fn host_port(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// Stream that completes immediately, for backends that cannot push updates.
#[must_use]
pub fn empty_watch() -> WatchStream {
    Box::pin(futures::stream::empty())
}

/// Keep only the instances reported healthy.
#[must_use]
pub fn healthy_only(instances: &[ServiceInstance]) -> Vec<ServiceInstance> {
    instances.iter().filter(|i| i.healthy).cloned().collect()
}
