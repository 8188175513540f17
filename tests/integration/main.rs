//! Integration tests for Arbor
//!
//! These tests drive the binary and the crates together over a scratch repository.

use std::path::Path;
use std::process::Command;

use arbor_core::{ArborConfig, NodeId, RawChange};
use arbor_pipeline::PipelineBuilder;
use arbor_watcher::{IgnoreRules, scan_repository};
use tempfile::TempDir;

/// A repository with a two-file import cycle, a leaf module and ignored noise.
fn scratch_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "src/modules/auth/login.js", "import session from './session';\n");
    write(root, "src/modules/auth/session.js", "import login from './login';\n");
    write(root, "src/util.py", "import os\n");
    write(root, "node_modules/dep/index.js", "module.exports = {};\n");
    write(root, "debug.log", "noise\n");
    dir
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn arbor(root: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_arbor"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("failed to run arbor")
}

#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    let output = arbor(dir.path(), &["version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(&format!("Arbor v{}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn test_snapshot_command_summarizes_repository() {
    let repo = scratch_repo();
    let output = arbor(repo.path(), &["snapshot"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Nodes:  3"), "{}", stdout);
    assert!(stdout.contains("Links:  3"), "{}", stdout);
    assert!(stdout.contains("Cycles: 1"), "{}", stdout);
}

#[test]
fn test_invalid_config_is_rejected() {
    let repo = scratch_repo();
    write(repo.path(), ".arbor.toml", "[ingest]\nmax_batch_size = 0\n");

    let output = arbor(repo.path(), &["snapshot"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_batch_size"));
}

#[tokio::test]
async fn test_repository_changes_flow_through_pipeline() {
    let repo = scratch_repo();
    let config = ArborConfig::load(repo.path()).unwrap();
    let ctx = PipelineBuilder::new(config.clone()).start().unwrap();

    let rules = IgnoreRules::new(&config.ingest.ignore).unwrap();
    for raw in scan_repository(repo.path(), &rules).unwrap() {
        ctx.submit_raw(raw).unwrap();
    }
    ctx.flush().await.unwrap();

    let snapshot = ctx.snapshot();
    assert_eq!(snapshot.node_count(), 3);
    assert!(snapshot.nodes.contains_key(&NodeId::from("src/modules/auth/login.js")));
    assert_eq!(ctx.cycles().len(), 1);

    ctx.submit_raw(RawChange::new("unlink", "src/modules/auth/session.js", None))
        .unwrap();
    ctx.flush().await.unwrap();

    let snapshot = ctx.snapshot();
    assert_eq!(snapshot.node_count(), 2);
    assert!(ctx.cycles().is_empty());
    assert_eq!(ctx.stats().gateway.processed_changes, 4);

    ctx.shutdown().await;
}
