// A two-host cluster over real gRPC transports.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};

use common::{spawn_host, text_of};
use toolmesh_cluster::discovery::StaticDiscovery;
use toolmesh_cluster::transport::{CallToolParams, GrpcTransportFactory, TransportExt};
use toolmesh_cluster::{Cluster, ClusterConfig, ClusterTransport, Error, NodeState, Transport};

fn echo(text: &str) -> CallToolParams {
    let mut arguments = Map::new();
    arguments.insert("text".to_string(), json!(text));
    CallToolParams {
        name: "echo".to_string(),
        arguments,
    }
}

fn config(discovery: Arc<StaticDiscovery>) -> ClusterConfig {
    ClusterConfig {
        health_check_interval: Duration::from_secs(60),
        health_check_timeout: Duration::from_millis(500),
        max_failures: 2,
        retry_attempts: 3,
        retry_delay: Duration::from_millis(10),
        request_timeout: Some(Duration::from_secs(5)),
        ..ClusterConfig::new(
            "tools",
            discovery,
            Arc::new(GrpcTransportFactory::default()),
        )
    }
}

#[tokio::test]
async fn test_calls_spread_across_hosts() {
    let alpha = spawn_host("alpha", None).await;
    let beta = spawn_host("beta", None).await;
    let discovery = Arc::new(StaticDiscovery::new(vec![
        alpha.instance("a"),
        beta.instance("b"),
    ]));
    let cluster = Arc::new(Cluster::new(config(discovery)).unwrap());
    let transport = ClusterTransport::new(cluster.clone());
    transport.connect().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        let result = transport.call_tool(&echo("x")).await.unwrap();
        seen.push(text_of(&result));
    }
    assert_eq!(seen.iter().filter(|t| *t == "alpha:x").count(), 2);
    assert_eq!(seen.iter().filter(|t| *t == "beta:x").count(), 2);

    transport.close().await.unwrap();
    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_failover_when_host_goes_away() {
    let alpha = spawn_host("alpha", None).await;
    let beta = spawn_host("beta", None).await;
    let discovery = Arc::new(StaticDiscovery::new(vec![
        alpha.instance("a"),
        beta.instance("b"),
    ]));
    let cluster = Cluster::new(config(discovery)).unwrap();
    cluster.start().await.unwrap();

    alpha.shutdown().await;

    for _ in 0..4 {
        let result = cluster
            .send("tools/call", json!({"name": "echo", "arguments": {"text": "y"}}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "beta:y");
    }
    assert_eq!(cluster.node("a").unwrap().state(), NodeState::Unhealthy);
    assert_eq!(cluster.healthy_nodes().len(), 1);

    // The probe keeps failing while alpha is down.
    cluster.check_health().await;
    assert_eq!(cluster.node("a").unwrap().state(), NodeState::Unhealthy);

    beta.shutdown().await;
    let err = cluster.send("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable { .. }));

    cluster.stop().await.unwrap();
}
