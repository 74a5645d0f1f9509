// Shared fixtures: an in-process tool host on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;

use futures::stream;
use serde_json::{Map, Value as Json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::ServerTlsConfig;

use toolmesh_cluster::discovery::ServiceInstance;
use toolmesh_cluster::transport::{CallToolResult, Tool, ToolServer, ToolSet};
use toolmesh_cluster::Error;

pub struct Host {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<toolmesh_cluster::Result<()>>,
}

impl Host {
    pub fn instance(&self, id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "tools", self.addr.ip().to_string(), self.addr.port())
    }

    /// Stop serving and wait until the listener is gone.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

fn tool(name: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: format!("{name} test tool"),
        input_schema: Map::new(),
    }
}

/// `echo` answers "<host>:<text>", `fail` always errors, `count` streams
/// three parts.
pub fn tool_set(host: &str) -> ToolSet {
    let tools = ToolSet::new(host, "0.1.0").with_page_size(2);

    let name = host.to_string();
    tools
        .register(tool("echo"), move |args| {
            let name = name.clone();
            async move {
                let text = args.get("text").and_then(Json::as_str).unwrap_or_default();
                Ok(CallToolResult::text(format!("{name}:{text}")))
            }
        })
        .unwrap();
    tools
        .register(tool("fail"), |_| async {
            Err(Error::Internal("tool exploded".into()))
        })
        .unwrap();
    tools
        .register_stream(tool("count"), |_| {
            stream::iter((1..=3).map(|i| Ok(CallToolResult::text(i.to_string()))))
        })
        .unwrap();
    tools
}

pub async fn spawn_host(name: &str, tls: Option<ServerTlsConfig>) -> Host {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = ToolServer::new(tool_set(name));
    let task = tokio::spawn(server.serve(listener, tls, shutdown.clone()));
    Host {
        addr,
        shutdown,
        task,
    }
}

pub fn text_of(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| c.text.clone())
        .collect::<Vec<_>>()
        .join("")
}
