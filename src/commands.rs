//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arbor_core::{ArborConfig, DependencyGraph, GraphSnapshot, normalize};
use arbor_pipeline::{PathWatcher, PipelineBuilder};
use arbor_server::{ArborServer, ServerConfig};
use arbor_watcher::{IgnoreRules, IngressClient, IngressSettings, LocalWatcher, scan_repository};
use tracing::{info, warn};

pub async fn serve(root: PathBuf, host: String, port: u16, ingress: Option<String>) -> anyhow::Result<()> {
    let config = ArborConfig::load(&root)?;
    let snapshot = seed_snapshot(&root, &config)?;
    info!("Seeded {} nodes, {} links", snapshot.node_count(), snapshot.link_count());

    let ctx = PipelineBuilder::new(config.clone()).with_snapshot(snapshot).start()?;
    let shutdown = ctx.shutdown_token();

    match ingress {
        Some(url) => {
            info!("Taking changes from remote watcher at {}", url);
            let client = Arc::new(IngressClient::new(
                url,
                IngressSettings::from(&config.ingest),
                ctx.gateway().clone(),
            ));
            client.watch_path(&root.display().to_string()).await?;
            ctx.attach_watcher(Arc::clone(&client) as Arc<dyn PathWatcher>);
            tokio::spawn(client.run(shutdown.clone()));
        }
        None => {
            let rules = IgnoreRules::new(&config.ingest.ignore)?;
            let (watcher, _task) = LocalWatcher::start(&root, rules, ctx.gateway().clone(), shutdown.clone())?;
            watcher.watch_path(".").await?;
            ctx.attach_watcher(watcher as Arc<dyn PathWatcher>);
        }
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                signal_token.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    let server = ArborServer::new(Arc::clone(&ctx), ServerConfig { host, port });
    let served = server.start().await;
    ctx.shutdown().await;
    served
}

pub fn snapshot(root: PathBuf) -> anyhow::Result<()> {
    let config = ArborConfig::load(&root)?;
    let snapshot = seed_snapshot(&root, &config)?;
    let graph = DependencyGraph::from_snapshot(&snapshot);

    println!("Nodes:  {}", snapshot.node_count());
    println!("Links:  {}", snapshot.link_count());
    println!("Cycles: {}", graph.find_cycles().len());
    println!("Chains: {}", graph.dependency_chains().len());
    Ok(())
}

/// Scan the repository and normalize every file into the initial snapshot.
fn seed_snapshot(root: &Path, config: &ArborConfig) -> anyhow::Result<GraphSnapshot> {
    let rules = IgnoreRules::new(&config.ingest.ignore)?;
    let changes = scan_repository(root, &rules).with_context(|| format!("failed to scan {}", root.display()))?;
    let world = config.spatial.world_rect();

    let mut nodes = Vec::with_capacity(changes.len());
    let mut links = Vec::new();
    for raw in changes {
        match normalize(raw, world) {
            Ok(event) => {
                if let Some(payload) = event.payload {
                    nodes.push(payload.node);
                    links.extend(payload.links);
                }
            }
            Err(e) => warn!("Skipping file during seeding: {}", e),
        }
    }
    Ok(GraphSnapshot::from_records(nodes, links))
}
