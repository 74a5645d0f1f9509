//! The cluster behind the [`Transport`] trait
//!
//! Code written against a single transport can be pointed at a whole fleet
//! without changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;

use super::Cluster;
use crate::error::{Error, Result};
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct ClusterTransport {
    cluster: Arc<Cluster>,
}

impl ClusterTransport {
    #[must_use]
    pub const fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

#[async_trait]
impl Transport for ClusterTransport {
    /// Starts the cluster.
    async fn connect(&self) -> Result<()> {
        self.cluster.start().await
    }

    async fn send(&self, method: &str, params: Json) -> Result<Json> {
        self.cluster.send(method, params).await
    }

    /// Succeeds while at least one node is healthy.
    async fn probe(&self, _timeout: Duration) -> Result<()> {
        if self.cluster.healthy_nodes().is_empty() {
            return Err(Error::unavailable(format!(
                "no healthy nodes for service {}",
                self.cluster.service_name()
            )));
        }
        Ok(())
    }

    /// Stops the cluster.
    async fn close(&self) -> Result<()> {
        self.cluster.stop().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cluster::{ClusterConfig, NodeState};
    use crate::discovery::{ServiceInstance, StaticDiscovery};
    use crate::transport::{MockTransport, TransportExt, TransportFactory};

    fn cluster() -> Arc<Cluster> {
        let discovery = Arc::new(StaticDiscovery::new(vec![ServiceInstance::new(
            "a", "tools", "10.0.0.1", 7000,
        )]));
        let factory: Arc<dyn TransportFactory> =
            Arc::new(|_: &ServiceInstance| -> Result<Arc<dyn Transport>> {
                let mut mock = MockTransport::new();
                mock.expect_probe().returning(|_| Ok(()));
                mock.expect_send()
                    .returning(|_, _| Ok(json!({"timestamp": 7, "status": "ok"})));
                mock.expect_close().returning(|| Ok(()));
                Ok(Arc::new(mock))
            });
        let config = ClusterConfig {
            health_check_interval: Duration::from_secs(60),
            ..ClusterConfig::new("tools", discovery, factory)
        };
        Arc::new(Cluster::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_cluster_as_transport() {
        let transport = ClusterTransport::new(cluster());
        transport.connect().await.unwrap();
        transport.probe(Duration::from_secs(1)).await.unwrap();

        let pong = transport.ping().await.unwrap();
        assert_eq!(pong.timestamp, 7);
        assert_eq!(pong.status, "ok");

        transport.cluster().node("a").unwrap().set_state(NodeState::Unhealthy);
        assert!(matches!(
            transport.probe(Duration::from_secs(1)).await,
            Err(Error::Unavailable { .. })
        ));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
