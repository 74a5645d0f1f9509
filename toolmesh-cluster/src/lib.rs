//! Client-side plumbing for fleets of tool hosts
//!
//! [`discovery`] maps a service name to instances, [`transport`] speaks the
//! tool protocol to one instance, and [`cluster`] load-balances calls across
//! all of them with health checks and failover.

pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod transport;

pub use cluster::{
    Cluster, ClusterConfig, ClusterNode, ClusterTransport, LoadBalancingStrategy, NodeSnapshot,
    NodeState,
};
pub use config::{ClusterSettings, DiscoverySettings, TlsSettings};
pub use discovery::{ServiceDiscovery, ServiceInstance};
pub use error::{Error, Result};
pub use transport::{GrpcTransport, Transport, TransportExt, TransportFactory};
