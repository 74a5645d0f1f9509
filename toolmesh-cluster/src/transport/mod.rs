//! Transports to tool hosts
//!
//! A [`Transport`] sends one method call to a tool host and returns its JSON
//! result. [`GrpcTransport`] speaks `toolmesh.v1.ToolService`; the cluster's
//! [`ClusterTransport`](crate::cluster::ClusterTransport) implements the same
//! trait over a load-balanced fleet.

pub mod grpc;
pub mod server;
pub mod tls;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;

use crate::discovery::ServiceInstance;
use crate::error::{Error, Result};

pub use grpc::{GrpcTransport, GrpcTransportFactory, StreamCall};
pub use server::{ToolHandler, ToolServer, ToolSet};
pub use tls::TlsPolicy;
pub use types::*;

/// Capability negotiation.
pub const METHOD_INITIALIZE: &str = "initialize";
/// List available tools, one page per call.
pub const METHOD_LIST_TOOLS: &str = "tools/list";
/// Invoke a tool.
pub const METHOD_CALL_TOOL: &str = "tools/call";
/// Liveness round trip.
pub const METHOD_PING: &str = "ping";

/// A connection to one tool host (or something that looks like one).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying channel. Idempotent once connected.
    async fn connect(&self) -> Result<()>;

    /// Dispatch `method` with JSON `params`, connecting first if needed.
    async fn send(&self, method: &str, params: Json) -> Result<Json>;

    /// Lightweight connectivity check bounded by `timeout`.
    async fn probe(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.connect())
            .await
            .map_err(|_| Error::DeadlineExceeded(format!("probe timed out after {timeout:?}")))?
    }

    /// Tear down the channel. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Creates the transport owned by a cluster node.
pub trait TransportFactory: Send + Sync {
    fn create(&self, instance: &ServiceInstance) -> Result<Arc<dyn Transport>>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ServiceInstance) -> Result<Arc<dyn Transport>> + Send + Sync,
{
    fn create(&self, instance: &ServiceInstance) -> Result<Arc<dyn Transport>> {
        self(instance)
    }
}

/// Typed wrappers over [`Transport::send`].
#[async_trait]
pub trait TransportExt: Transport {
    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| Error::InvalidArgument(format!("Failed to encode {method} params: {e}")))?;
        let result = self.send(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Internal(format!("Malformed {method} result: {e}")))
    }

    async fn initialize(&self, params: &InitializeParams) -> Result<InitializeResult> {
        self.call(METHOD_INITIALIZE, params).await
    }

    async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.call(METHOD_LIST_TOOLS, &ListToolsParams { cursor }).await
    }

    /// Follow `next_cursor` until the host reports the last page.
    async fn list_all_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_tools(cursor).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    async fn call_tool(&self, params: &CallToolParams) -> Result<CallToolResult> {
        self.call(METHOD_CALL_TOOL, params).await
    }

    async fn ping(&self) -> Result<PingResult> {
        self.call(METHOD_PING, &PingParams::default()).await
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_all_tools_follows_cursor() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .with(eq(METHOD_LIST_TOOLS), eq(json!({})))
            .times(1)
            .returning(|_, _| {
                Ok(json!({"tools": [{"name": "a"}], "nextCursor": "1"}))
            });
        mock.expect_send()
            .with(eq(METHOD_LIST_TOOLS), eq(json!({"cursor": "1"})))
            .times(1)
            .returning(|_, _| Ok(json!({"tools": [{"name": "b"}]})));

        let tools = mock.list_all_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_malformed_result_is_internal() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .returning(|_, _| Ok(json!({"timestamp": "soon"})));
        assert!(matches!(mock.ping().await, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = |instance: &ServiceInstance| -> Result<Arc<dyn Transport>> {
            let mut mock = MockTransport::new();
            let endpoint = instance.endpoint();
            mock.expect_send()
                .returning(move |_, _| Ok(json!(endpoint.clone())));
            Ok(Arc::new(mock))
        };
        let transport = factory
            .create(&ServiceInstance::new("a", "svc", "10.0.0.1", 7000))
            .unwrap();
        assert_eq!(
            transport.send(METHOD_PING, json!({})).await.unwrap(),
            json!("10.0.0.1:7000")
        );
    }
}
