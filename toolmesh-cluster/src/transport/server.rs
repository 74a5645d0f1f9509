//! Tool-host side of `toolmesh.v1.ToolService`
//!
//! [`ToolServer`] adapts any [`ToolHandler`] to the generated tonic service.
//! [`ToolSet`] is an in-memory handler holding named async tool functions.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::{Map, Value as Json};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use toolmesh_proto::v1;
use toolmesh_proto::{ToolService, ToolServiceServer};

use super::now_millis;
use super::types::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsResult, Tool, PROTOCOL_VERSION,
};
use crate::error::{Error, Result};

/// Status reported by a healthy host in ping responses.
pub const PING_STATUS_OK: &str = "ok";

/// What a tool host does with each request.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult>;

    async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult>;

    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult>;

    /// Progressive output; by default the unary result as a single item.
    async fn call_tool_stream(
        &self,
        params: CallToolParams,
    ) -> Result<BoxStream<'static, Result<CallToolResult>>> {
        let result = self.call_tool(params).await?;
        Ok(stream::once(async move { Ok(result) }).boxed())
    }
}

/// tonic service over a [`ToolHandler`].
pub struct ToolServer<H> {
    handler: Arc<H>,
}

impl<H> Clone for ToolServer<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<H: ToolHandler> ToolServer<H> {
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    #[must_use]
    pub const fn from_arc(handler: Arc<H>) -> Self {
        Self { handler }
    }

    #[must_use]
    pub fn into_service(self) -> ToolServiceServer<Self> {
        ToolServiceServer::new(self)
    }

    /// Serve on `listener` until `shutdown` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        tls: Option<ServerTlsConfig>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        let mut builder = Server::builder();
        if let Some(tls) = tls {
            builder = builder
                .tls_config(tls)
                .map_err(|e| Error::Configuration(format!("Invalid server TLS config: {e}")))?;
        }

        tracing::info!(address = ?local, "Tool server listening");
        builder
            .add_service(self.into_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await
            .map_err(|e| Error::Transport(format!("Tool server error: {e}")))?;
        tracing::info!(address = ?local, "Tool server stopped");
        Ok(())
    }
}

#[tonic::async_trait]
impl<H: ToolHandler> ToolService for ToolServer<H> {
    async fn initialize(
        &self,
        request: Request<v1::InitializeRequest>,
    ) -> std::result::Result<Response<v1::InitializeResponse>, Status> {
        let params = InitializeParams::from(request.into_inner());
        let result = self.handler.initialize(params).await?;
        Ok(Response::new(result.into()))
    }

    async fn list_tools(
        &self,
        request: Request<v1::ListToolsRequest>,
    ) -> std::result::Result<Response<v1::ListToolsResponse>, Status> {
        let cursor = request.into_inner().cursor;
        let cursor = (!cursor.is_empty()).then_some(cursor);
        let result = self.handler.list_tools(cursor).await?;
        Ok(Response::new(result.into()))
    }

    async fn call_tool(
        &self,
        request: Request<v1::CallToolRequest>,
    ) -> std::result::Result<Response<v1::CallToolResponse>, Status> {
        let params = CallToolParams::from(request.into_inner());
        tracing::debug!(tool = %params.name, "Tool call");
        let result = self.handler.call_tool(params).await?;
        Ok(Response::new(result.into()))
    }

    type CallToolStreamStream =
        Pin<Box<dyn futures::Stream<Item = std::result::Result<v1::CallToolResponse, Status>> + Send>>;

    async fn call_tool_stream(
        &self,
        request: Request<v1::CallToolRequest>,
    ) -> std::result::Result<Response<Self::CallToolStreamStream>, Status> {
        let params = CallToolParams::from(request.into_inner());
        tracing::debug!(tool = %params.name, "Streamed tool call");
        let stream = self.handler.call_tool_stream(params).await?;
        let stream = stream
            .map_ok(v1::CallToolResponse::from)
            .map_err(Status::from);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn ping(
        &self,
        request: Request<v1::PingRequest>,
    ) -> std::result::Result<Response<v1::PingResponse>, Status> {
        let timestamp = match request.into_inner().timestamp {
            0 => now_millis(),
            ts => ts,
        };
        Ok(Response::new(v1::PingResponse {
            timestamp,
            status: PING_STATUS_OK.to_string(),
        }))
    }
}

type UnaryFn = Arc<dyn Fn(Map<String, Json>) -> BoxFuture<'static, Result<CallToolResult>> + Send + Sync>;
type StreamFn =
    Arc<dyn Fn(Map<String, Json>) -> BoxStream<'static, Result<CallToolResult>> + Send + Sync>;

#[derive(Clone)]
enum ToolFn {
    Unary(UnaryFn),
    Streaming(StreamFn),
}

struct Entry {
    tool: Tool,
    run: ToolFn,
}

/// In-memory tool host.
pub struct ToolSet {
    info: Implementation,
    instructions: Option<String>,
    page_size: usize,
    tools: RwLock<Vec<Entry>>,
}

impl ToolSet {
    pub const DEFAULT_PAGE_SIZE: usize = 50;

    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            instructions: None,
            page_size: Self::DEFAULT_PAGE_SIZE,
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Tools per `tools/list` page (at least one).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a tool answering with one result.
    pub fn register<F, Fut>(&self, tool: Tool, run: F) -> Result<()>
    where
        F: Fn(Map<String, Json>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
    {
        let run: UnaryFn = Arc::new(move |args| Box::pin(run(args)));
        self.insert(tool, ToolFn::Unary(run))
    }

    /// Register a tool producing progressive output.
    pub fn register_stream<F, S>(&self, tool: Tool, run: F) -> Result<()>
    where
        F: Fn(Map<String, Json>) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<CallToolResult>> + Send + 'static,
    {
        let run: StreamFn = Arc::new(move |args| run(args).boxed());
        self.insert(tool, ToolFn::Streaming(run))
    }

    fn insert(&self, tool: Tool, run: ToolFn) -> Result<()> {
        if tool.name.is_empty() {
            return Err(Error::InvalidArgument("tool name is empty".to_string()));
        }
        let mut tools = self.tools.write();
        if tools.iter().any(|e| e.tool.name == tool.name) {
            return Err(Error::InvalidArgument(format!(
                "tool '{}' is already registered",
                tool.name
            )));
        }
        tools.push(Entry { tool, run });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    fn lookup(&self, name: &str) -> Result<ToolFn> {
        self.tools
            .read()
            .iter()
            .find(|e| e.tool.name == name)
            .map(|e| e.run.clone())
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))
    }
}

#[async_trait]
impl ToolHandler for ToolSet {
    async fn initialize(&self, _params: InitializeParams) -> Result<InitializeResult> {
        let mut capabilities = Map::new();
        capabilities.insert("tools".to_string(), Json::Object(Map::new()));
        Ok(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_info: Some(self.info.clone()),
            capabilities,
            instructions: self.instructions.clone(),
        })
    }

    async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        let offset = match cursor.as_deref() {
            None => 0,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::InvalidArgument(format!("invalid cursor '{raw}'")))?,
        };
        let tools = self.tools.read();
        let end = offset.saturating_add(self.page_size).min(tools.len());
        let page = tools
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| e.tool.clone())
            .collect();
        Ok(ListToolsResult {
            tools: page,
            next_cursor: (end < tools.len()).then(|| end.to_string()),
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult> {
        let result = match self.lookup(&params.name)? {
            ToolFn::Unary(run) => run(params.arguments).await,
            ToolFn::Streaming(run) => {
                run(params.arguments)
                    .try_fold(CallToolResult::default(), |mut merged, part| async move {
                        merged.is_error |= part.is_error;
                        merged.content.extend(part.content);
                        Ok(merged)
                    })
                    .await
            }
        };
        // A tool that ran and failed answers with an error payload.
        Ok(result.unwrap_or_else(|e| {
            tracing::debug!(tool = %params.name, error = %e, "Tool failed");
            CallToolResult::error(e.to_string())
        }))
    }

    async fn call_tool_stream(
        &self,
        params: CallToolParams,
    ) -> Result<BoxStream<'static, Result<CallToolResult>>> {
        match self.lookup(&params.name)? {
            ToolFn::Streaming(run) => Ok(run(params.arguments)),
            ToolFn::Unary(run) => {
                let result = run(params.arguments)
                    .await
                    .unwrap_or_else(|e| CallToolResult::error(e.to_string()));
                Ok(stream::once(async move { Ok(result) }).boxed())
            }
        }
    }
}
