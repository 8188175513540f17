use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{ArborConfig, Diff, GraphSnapshot, LinkKind, LinkRecord, NodeId, NodeKind, NodeRecord, Position, RawChange};
use arbor_pipeline::{PipelineBuilder, PipelineContext, ResourceProbe, ResourceUsage};
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use crate::{ArborServer, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

struct IdleProbe;

impl ResourceProbe for IdleProbe {
    fn sample(&self) -> ResourceUsage {
        ResourceUsage::default()
    }
}

fn node(id: &str, x: f64, y: f64) -> NodeRecord {
    let mut node = NodeRecord::new(id, NodeKind::Module);
    node.position = Position::new(x, y);
    node
}

fn seeded_context() -> Arc<PipelineContext> {
    let mut config = ArborConfig::default();
    config.spatial.world = [0.0, 0.0, 1000.0, 1000.0];
    config.throttle.resource_check_every = 1000;

    let snapshot = GraphSnapshot::from_records(
        vec![node("a", 50.0, 50.0), node("b", 500.0, 500.0), node("c", 900.0, 900.0)],
        vec![
            LinkRecord::new("a", "b", LinkKind::Import, 1.0),
            LinkRecord::new("b", "c", LinkKind::Import, 1.0),
        ],
    );
    PipelineBuilder::new(config)
        .with_snapshot(snapshot)
        .with_probe(Arc::new(IdleProbe))
        .start()
        .unwrap()
}

async fn spawn_server(ctx: Arc<PipelineContext>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ArborServer::new(ctx, ServerConfig::default());
    tokio::spawn(server.serve(listener));
    addr
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Next text frame whose `type` is `kind`, skipping everything else.
async fn next_of(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

async fn get_json(client: &reqwest::Client, url: String) -> Value {
    let response = client.get(url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_renderer_endpoints() {
    let ctx = seeded_context();
    let addr = spawn_server(Arc::clone(&ctx)).await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    let health = get_json(&client, format!("{}/api/health", base)).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["queue_health"], "healthy");

    let graph = get_json(&client, format!("{}/api/graph", base)).await;
    assert_eq!(graph["nodes"].as_object().unwrap().len(), 3);

    let viewport = get_json(
        &client,
        format!("{}/api/viewport?x=0&y=0&width=200&height=200&zoom=1", base),
    )
    .await;
    assert_eq!(viewport["visible_node_ids"], json!(["a"]));
    assert_eq!(viewport["culled_count"], 2);

    let bad = client
        .get(format!("{}/api/viewport?x=0&y=0&width=-5&height=200", base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    let metrics: Value = client
        .post(format!("{}/api/frames", base))
        .json(&json!({"durations_ms": [50.0, 50.0]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["fps"], 20.0);

    let layout: Value = client
        .post(format!("{}/api/layout", base))
        .json(&json!({"positions": {"a": {"x": 120.0, "y": 80.0}}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(layout["result_version"], 1);
    assert_eq!(ctx.snapshot().nodes[&NodeId::from("a")].position, Position::new(120.0, 80.0));

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_control_and_query_endpoints() {
    let ctx = seeded_context();
    let addr = spawn_server(Arc::clone(&ctx)).await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", addr);

    let throttle: Value = client
        .post(format!("{}/api/throttle", base))
        .json(&json!({"level": 7.5}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(throttle["level"], 5.0);

    let adaptive: Value = client
        .post(format!("{}/api/throttle/adaptive", base))
        .json(&json!({"enabled": false}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(adaptive["adaptive_enabled"], false);

    let disabled = client
        .post(format!("{}/api/analyzers/security/disable", base))
        .send()
        .await
        .unwrap();
    assert_eq!(disabled.status(), StatusCode::OK);
    assert!(ctx.analyzers().iter().any(|info| info.name == "security" && !info.enabled));

    let unknown = client
        .post(format!("{}/api/analyzers/astrology/enable", base))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let accepted = client
        .post(format!("{}/api/analysis", base))
        .json(&json!({"diff": Diff::default(), "priority": 9}))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    let accepted: Value = accepted.json().await.unwrap();
    assert_eq!(accepted["priority"], 9);

    let no_watcher = client
        .post(format!("{}/api/watch", base))
        .json(&json!({"path": "src"}))
        .send()
        .await
        .unwrap();
    assert_eq!(no_watcher.status(), StatusCode::BAD_REQUEST);

    let cleared = client.delete(format!("{}/api/cache", base)).send().await.unwrap();
    assert_eq!(cleared.status(), StatusCode::NO_CONTENT);

    let path = get_json(&client, format!("{}/api/query/path?from=a&to=c", base)).await;
    assert_eq!(path["nodes"], json!(["a", "b", "c"]));

    let missing = client
        .get(format!("{}/api/query/path?from=c&to=a", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let cycles = get_json(&client, format!("{}/api/query/cycles", base)).await;
    assert_eq!(cycles["cycles"], json!([]));

    let chains = get_json(&client, format!("{}/api/query/chains", base)).await;
    assert_eq!(chains["chains"], json!([["a", "b", "c"]]));

    let stats = get_json(&client, format!("{}/api/stats", base)).await;
    assert_eq!(stats["node_count"], 3);
    assert_eq!(stats["throttle"]["level"], 5.0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_websocket_pushes_snapshot_replies_and_diffs() {
    let ctx = seeded_context();
    let addr = spawn_server(Arc::clone(&ctx)).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    let snapshot = next_of(&mut socket, "snapshot").await;
    assert_eq!(snapshot["snapshot"]["nodes"].as_object().unwrap().len(), 3);

    socket.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
    ctx.submit_raw(RawChange::new("add", "src/d.js", Some("import a from './a';\n".to_string())))
        .unwrap();
    ctx.flush().await.unwrap();

    let mut seen_pong = false;
    let mut committed = None;
    while !(seen_pong && committed.is_some()) {
        let frame = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            match value["type"].as_str() {
                Some("pong") => seen_pong = true,
                Some("diff_committed") => committed = Some(value),
                _ => {}
            }
        }
    }
    let committed = committed.unwrap();
    assert_eq!(committed["diff"]["result_version"], 1);
    assert_eq!(committed["diff"]["added_nodes"][0]["id"], "src/d.js");

    ctx.shutdown().await;
}
