mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as Json};
use tracing::info;

use toolmesh_cluster::transport::CallToolParams;
use toolmesh_cluster::{Cluster, ClusterTransport, TransportExt};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "toolmesh")]
#[command(about = "Call tools across a discovered fleet of tool hosts", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TOOLMESH_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Service to target; overrides `cluster.service_name`
    #[arg(short, long)]
    service: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Round-trip a ping through the cluster
    Ping,
    /// List every tool the service offers
    List,
    /// Invoke a tool with a JSON object of arguments
    Call {
        name: String,
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Probe every node once and print the node table
    Nodes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(service) = args.service {
        config.cluster.service_name = service;
    }

    logging::init_logging(&config.logging)?;

    let cluster = Arc::new(Cluster::from_settings(&config.cluster)?);
    cluster.start().await?;
    info!(
        service = %cluster.service_name(),
        nodes = cluster.node_count(),
        "Cluster ready"
    );

    let outcome = run(&cluster, args.command).await;
    cluster.stop().await?;
    outcome
}

async fn run(cluster: &Arc<Cluster>, command: Command) -> Result<()> {
    let transport = ClusterTransport::new(cluster.clone());

    match command {
        Command::Ping => {
            let started = Instant::now();
            let pong = transport.ping().await?;
            println!("{} in {} ms", pong.status, started.elapsed().as_millis());
        }
        Command::List => {
            for tool in transport.list_all_tools().await? {
                println!("{}\t{}", tool.name, tool.description);
            }
        }
        Command::Call { name, arguments } => {
            let arguments = parse_arguments(&arguments)?;
            let result = transport
                .call_tool(&CallToolParams { name, arguments })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_error {
                anyhow::bail!("tool reported an error");
            }
        }
        Command::Nodes => {
            cluster.check_health().await;
            println!("{}", serde_json::to_string_pretty(&cluster.snapshots())?);
        }
    }
    Ok(())
}

fn parse_arguments(raw: &str) -> Result<Map<String, Json>> {
    match serde_json::from_str::<Json>(raw).context("arguments must be valid JSON")? {
        Json::Object(map) => Ok(map),
        other => anyhow::bail!("arguments must be a JSON object, got {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let args = parse_arguments(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(args["text"], "hi");
        assert!(parse_arguments("[1, 2]").is_err());
        assert!(parse_arguments("{").is_err());
    }

    #[test]
    fn test_cli_parses_call() {
        let args = Args::try_parse_from(["toolmesh", "-s", "tools", "call", "echo", "{}"]).unwrap();
        assert_eq!(args.service.as_deref(), Some("tools"));
        assert!(matches!(args.command, Command::Call { ref name, .. } if name == "echo"));
    }
}
