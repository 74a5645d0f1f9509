//! gRPC transport to a single tool host
//!
//! Features:
//! - Lazy, idempotent connection (one cached `tonic` channel per transport)
//! - Optional TLS through a custom `rustls` connector (see [`TlsPolicy`])
//! - Optional per-call deadline reported as `DeadlineExceeded`
//! - Health probes that perform the full connect, handshake included
//! - Server-streamed tool calls forwarded onto a channel pair

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, warn};

use toolmesh_proto::v1;
use toolmesh_proto::ToolServiceClient;

use super::tls::TlsPolicy;
use super::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, PingParams, PingResult,
};
use super::{
    now_millis, Transport, TransportFactory, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_LIST_TOOLS, METHOD_PING,
};
use crate::discovery::{host_port, ServiceInstance};
use crate::error::{Error, Result};

/// Buffer between the stream forwarder and the consumer.
const STREAM_BUFFER: usize = 16;

/// A decoded request, ready to dispatch.
enum Call {
    Initialize(v1::InitializeRequest),
    ListTools(v1::ListToolsRequest),
    CallTool(v1::CallToolRequest),
    Ping(v1::PingRequest),
}

impl Call {
    fn parse(method: &str, params: Json) -> Result<Self> {
        match method {
            METHOD_INITIALIZE => {
                Ok(Self::Initialize(decode::<InitializeParams>(method, params)?.into()))
            }
            METHOD_LIST_TOOLS => {
                let params = decode::<ListToolsParams>(method, params)?;
                Ok(Self::ListTools(v1::ListToolsRequest {
                    cursor: params.cursor.unwrap_or_default(),
                }))
            }
            METHOD_CALL_TOOL => Ok(Self::CallTool(decode::<CallToolParams>(method, params)?.into())),
            METHOD_PING => {
                let params = decode::<PingParams>(method, params)?;
                Ok(Self::Ping(v1::PingRequest {
                    timestamp: params.timestamp.unwrap_or_else(now_millis),
                }))
            }
            other => Err(Error::Unsupported(format!("unknown method '{other}'"))),
        }
    }
}

fn decode<T: DeserializeOwned>(method: &str, params: Json) -> Result<T> {
    let params = if params.is_null() {
        Json::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| Error::InvalidArgument(format!("Invalid {method} params: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Json> {
    serde_json::to_value(value).map_err(|e| Error::Internal(format!("Failed to encode result: {e}")))
}

/// Progressive output of a streamed tool call.
///
/// `results` closes when the host finishes or fails; a failure is delivered
/// on `error`, which otherwise closes without a value.
#[derive(Debug)]
pub struct StreamCall {
    pub results: mpsc::Receiver<CallToolResult>,
    pub error: oneshot::Receiver<Error>,
}

impl StreamCall {
    /// Drain every partial result, failing if the stream ended in error.
    pub async fn collect(mut self) -> Result<Vec<CallToolResult>> {
        let mut results = Vec::new();
        while let Some(result) = self.results.recv().await {
            results.push(result);
        }
        match self.error.await {
            Ok(e) => Err(e),
            Err(_) => Ok(results),
        }
    }
}

/// Transport speaking `toolmesh.v1.ToolService` to one endpoint.
pub struct GrpcTransport {
    host: String,
    endpoint: String,
    tls: Option<TlsPolicy>,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    channel: Mutex<Option<Channel>>,
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("endpoint", &self.endpoint)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl GrpcTransport {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let host = address.into();
        Self {
            endpoint: host_port(&host, port),
            host,
            tls: None,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            channel: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn for_instance(instance: &ServiceInstance) -> Self {
        Self::new(instance.address.clone(), instance.port)
    }

    #[must_use]
    pub fn with_tls(mut self, policy: TlsPolicy) -> Self {
        self.tls = Some(policy);
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound every unary call (and the opening of a streamed call).
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    async fn client(&self) -> Result<ToolServiceClient<Channel>> {
        let mut channel = self.channel.lock().await;
        if let Some(existing) = channel.as_ref() {
            return Ok(ToolServiceClient::new(existing.clone()));
        }
        let opened = self.open_channel().await?;
        debug!(
            endpoint = %self.endpoint,
            tls = self.tls.is_some(),
            "Connected to tool host"
        );
        *channel = Some(opened.clone());
        Ok(ToolServiceClient::new(opened))
    }

    async fn open_channel(&self) -> Result<Channel> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.endpoint))
            .map_err(|e| Error::InvalidArgument(format!("Invalid endpoint {}: {e}", self.endpoint)))?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true);

        let Some(policy) = &self.tls else {
            return endpoint.connect().await.map_err(|e| {
                Error::Transport(format!("Failed to connect to {}: {e}", self.endpoint))
            });
        };

        let connector = TlsConnector::from(policy.client_config());
        let server_name = policy.server_name(&self.host)?;
        let address = self.endpoint.clone();
        let connect_timeout = self.connect_timeout;

        endpoint
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let connector = connector.clone();
                let server_name = server_name.clone();
                let address = address.clone();
                async move {
                    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(address.as_str()))
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
                    tcp.set_nodelay(true)?;
                    let tls = connector.connect(server_name, tcp).await?;
                    Ok::<_, io::Error>(TokioIo::new(tls))
                }
            }))
            .await
            .map_err(|e| {
                Error::Transport(format!("Failed TLS connect to {}: {e}", self.endpoint))
            })
    }

    async fn rpc<T, F>(&self, method: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        let response = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                Error::DeadlineExceeded(format!(
                    "{method} to {} timed out after {limit:?}",
                    self.endpoint
                ))
            })?,
            None => call.await,
        };
        response.map(tonic::Response::into_inner).map_err(|status| {
            debug!(
                endpoint = %self.endpoint,
                method = %method,
                code = ?status.code(),
                message = %status.message(),
                "Tool host returned error status"
            );
            Error::from(status)
        })
    }

    async fn dispatch(&self, call: Call) -> Result<Json> {
        let mut client = self.client().await?;
        match call {
            Call::Initialize(request) => {
                let response = self
                    .rpc(METHOD_INITIALIZE, client.initialize(request))
                    .await?;
                encode(&InitializeResult::from(response))
            }
            Call::ListTools(request) => {
                let response = self
                    .rpc(METHOD_LIST_TOOLS, client.list_tools(request))
                    .await?;
                encode(&ListToolsResult::from(response))
            }
            Call::CallTool(request) => {
                let response = self.rpc(METHOD_CALL_TOOL, client.call_tool(request)).await?;
                encode(&CallToolResult::from(response))
            }
            Call::Ping(request) => {
                let response = self.rpc(METHOD_PING, client.ping(request)).await?;
                encode(&PingResult::from(response))
            }
        }
    }

    /// Invoke a tool whose output arrives progressively.
    pub async fn stream_call_tool(&self, params: CallToolParams) -> Result<StreamCall> {
        let mut client = self.client().await?;
        let mut stream = self
            .rpc(
                METHOD_CALL_TOOL,
                client.call_tool_stream(v1::CallToolRequest::from(params)),
            )
            .await?;

        let (result_tx, results) = mpsc::channel(STREAM_BUFFER);
        let (error_tx, error) = oneshot::channel();
        let endpoint = self.endpoint.clone();

        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(message)) => {
                        if result_tx.send(message.into()).await.is_err() {
                            debug!(endpoint = %endpoint, "Stream consumer dropped, abandoning call");
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        warn!(
                            endpoint = %endpoint,
                            code = ?status.code(),
                            "Streamed tool call failed"
                        );
                        let _ = error_tx.send(Error::from(status));
                        return;
                    }
                }
            }
        });

        Ok(StreamCall { results, error })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn connect(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }

    async fn send(&self, method: &str, params: Json) -> Result<Json> {
        let call = Call::parse(method, params)?;
        self.dispatch(call).await
    }

    /// Full connect (TCP plus TLS handshake when configured) on a throwaway
    /// channel; the cached channel is left alone.
    async fn probe(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.open_channel()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::DeadlineExceeded(format!(
                "probe of {} timed out after {timeout:?}",
                self.endpoint
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.channel.lock().await.take().is_some() {
            debug!(endpoint = %self.endpoint, "Closed tool host channel");
        }
        Ok(())
    }
}

/// Builds a [`GrpcTransport`] per cluster node with shared TLS settings.
#[derive(Debug, Clone)]
pub struct GrpcTransportFactory {
    tls: Option<TlsPolicy>,
    connect_timeout: Duration,
}

impl Default for GrpcTransportFactory {
    fn default() -> Self {
        Self::new(None, GrpcTransport::DEFAULT_CONNECT_TIMEOUT)
    }
}

impl GrpcTransportFactory {
    #[must_use]
    pub fn new(tls: Option<TlsPolicy>, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }
}

impl TransportFactory for GrpcTransportFactory {
    fn create(&self, instance: &ServiceInstance) -> Result<Arc<dyn Transport>> {
        let transport =
            GrpcTransport::for_instance(instance).with_connect_timeout(self.connect_timeout);
        Ok(Arc::new(match &self.tls {
            Some(policy) => transport.with_tls(policy.clone()),
            None => transport,
        }))
    }
}
