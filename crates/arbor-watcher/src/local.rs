//! Local filesystem watcher

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use arbor_core::RawChange;
use arbor_pipeline::{GatewayHandle, PathWatcher};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filter::{IgnoreRules, relative_path};

/// A filesystem notification reduced to what the gateway needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(path) | WatchEvent::Modified(path) | WatchEvent::Removed(path) => path,
        }
    }

    /// Ingress event name for this notification.
    fn event_name(&self) -> &'static str {
        match self {
            WatchEvent::Created(_) => "add",
            WatchEvent::Modified(_) => "change",
            WatchEvent::Removed(_) => "unlink",
        }
    }
}

/// Recursive `notify` watcher rooted at the repository. Changes are read,
/// filtered through the ignore rules and submitted to the gateway.
pub struct LocalWatcher {
    root: PathBuf,
    watcher: Mutex<RecommendedWatcher>,
    watched: Mutex<BTreeSet<String>>,
}

impl std::fmt::Debug for LocalWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWatcher")
            .field("root", &self.root)
            .field("watched", &lock(&self.watched).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalWatcher {
    /// Create the watcher and the task forwarding its events to `gateway`.
    /// Nothing is watched until [`PathWatcher::watch_path`] is called.
    pub fn start(
        root: impl AsRef<Path>,
        rules: IgnoreRules,
        gateway: GatewayHandle,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let root = root
            .as_ref()
            .canonicalize()
            .with_context(|| format!("cannot watch {}", root.as_ref().display()))?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let callback_root = root.clone();
        let callback_rules = rules.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                debug!("File system event: {:?}", event);
                handle_notify_event(event, &callback_root, &callback_rules, &event_tx);
            }
            Err(e) => error!("File system watch error: {}", e),
        })?;

        let local = Arc::new(LocalWatcher {
            root: root.clone(),
            watcher: Mutex::new(watcher),
            watched: Mutex::new(BTreeSet::new()),
        });
        let task = tokio::spawn(forward_events(root, event_rx, gateway, shutdown));
        Ok((local, task))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() { path.to_path_buf() } else { self.root.join(path) }
    }
}

#[async_trait::async_trait]
impl PathWatcher for LocalWatcher {
    async fn watch_path(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        info!("Watching directory: {:?}", target);
        lock(&self.watcher)
            .watch(&target, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", target.display()))?;
        lock(&self.watched).insert(path.to_string());
        Ok(())
    }

    async fn unwatch_path(&self, path: &str) -> Result<()> {
        let target = self.resolve(path);
        info!("Stopping watch for: {:?}", target);
        lock(&self.watcher)
            .unwatch(&target)
            .with_context(|| format!("failed to unwatch {}", target.display()))?;
        lock(&self.watched).remove(path);
        Ok(())
    }

    fn watched(&self) -> Vec<String> {
        lock(&self.watched).iter().cloned().collect()
    }
}

/// Map a notify event onto watch events, dropping ignored and out-of-root paths.
fn handle_notify_event(
    event: notify::Event,
    root: &Path,
    rules: &IgnoreRules,
    event_tx: &mpsc::UnboundedSender<WatchEvent>,
) {
    for path in event.paths {
        let Some(relative) = relative_path(root, &path) else {
            continue;
        };
        if rules.is_ignored(&relative) {
            continue;
        }
        let watch_event = match event.kind {
            notify::EventKind::Create(_) => WatchEvent::Created(path),
            // Renames arrive as modifications of both the old and the new name.
            notify::EventKind::Modify(_) if !path.exists() => WatchEvent::Removed(path),
            notify::EventKind::Modify(_) => WatchEvent::Modified(path),
            notify::EventKind::Remove(_) => WatchEvent::Removed(path),
            _ => continue,
        };
        if let Err(e) = event_tx.send(watch_event) {
            warn!("Failed to forward watch event: {}", e);
        }
    }
}

async fn forward_events(
    root: PathBuf,
    mut event_rx: mpsc::UnboundedReceiver<WatchEvent>,
    gateway: GatewayHandle,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Some(raw) = to_raw_change(&root, &event).await {
            // Malformed changes are logged and counted by the gateway.
            let _ = gateway.submit_raw(raw);
        }
    }
    debug!("Local watcher forwarding stopped");
}

async fn to_raw_change(root: &Path, event: &WatchEvent) -> Option<RawChange> {
    let path = event.path();
    let relative = relative_path(root, path)?;
    let content = match event {
        WatchEvent::Removed(_) => None,
        WatchEvent::Created(_) | WatchEvent::Modified(_) => {
            if tokio::fs::metadata(path).await.map(|meta| meta.is_dir()).unwrap_or(false) {
                return None;
            }
            match tokio::fs::read_to_string(path).await {
                Ok(content) => Some(content),
                Err(e) => {
                    debug!("Could not read {}: {}", relative, e);
                    None
                }
            }
        }
    };
    Some(RawChange::new(event.event_name(), relative, content))
}
