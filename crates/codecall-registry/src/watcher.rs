//! Function source watcher.
//!
//! Watches the registry root for changes, debounces bursts of events, and
//! refreshes the [`LiveRegistry`]. A refresh that fails to build keeps the
//! previous registry serving.
//!
//! Requires the `watch` feature.

use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::{LiveRegistry, Registry};

/// Debounce interval for rapid file changes.
const DEBOUNCE_MS: u64 = 200;

/// Errors starting the watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The registry was not built from a source root.
    #[error("registry has no source root to watch")]
    NoRoot,
    /// The filesystem watcher could not be set up.
    #[error("failed to watch function root: {0}")]
    Notify(#[from] notify::Error),
}

/// Refreshes a [`LiveRegistry`] when its source root changes.
pub struct RegistryWatcher {
    live: LiveRegistry,
    tx: watch::Sender<Arc<Registry>>,
    rx: watch::Receiver<Arc<Registry>>,
}

impl RegistryWatcher {
    /// Create a watcher for `live`. Fails if the registry has no root.
    pub fn new(live: LiveRegistry) -> Result<Self, WatchError> {
        if live.root().is_none() {
            return Err(WatchError::NoRoot);
        }
        let (tx, rx) = watch::channel(live.current());
        Ok(Self { live, tx, rx })
    }

    /// A receiver that yields each successfully refreshed registry.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Registry>> {
        self.rx.clone()
    }

    /// Start watching in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.watch_loop().await {
                tracing::error!(error = %e, "registry watcher stopped");
            }
        })
    }

    async fn watch_loop(&self) -> Result<(), WatchError> {
        let root = self.live.root().ok_or(WatchError::NoRoot)?.to_path_buf();
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<()>(16);

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let _ = notify_tx.try_send(());
                    }
                }
            })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        tracing::info!(root = %root.display(), "watching function sources");

        loop {
            if notify_rx.recv().await.is_none() {
                break;
            }

            tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
            while notify_rx.try_recv().is_ok() {}

            match self.live.refresh() {
                Ok(registry) => {
                    let _ = self.tx.send(registry);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "registry refresh failed, keeping previous registry");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &std::path::Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn rw_01_detects_new_function() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.ts", "export function one(): number { return 1; }\n");

        let live = LiveRegistry::discover(dir.path()).unwrap();
        let watcher = RegistryWatcher::new(live.clone()).unwrap();
        let mut rx = watcher.subscribe();
        let handle = watcher.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        write(dir.path(), "b.ts", "export function two(): number { return 2; }\n");

        let changed = tokio::time::timeout(Duration::from_secs(3), rx.changed()).await;
        assert!(changed.is_ok(), "should detect new source within timeout");
        assert!(rx.borrow().get("two").is_some());
        assert!(live.current().get("two").is_some());

        handle.abort();
    }

    #[tokio::test]
    async fn rw_02_broken_source_keeps_previous_registry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.ts", "export function one(): number { return 1; }\n");

        let live = LiveRegistry::discover(dir.path()).unwrap();
        let watcher = RegistryWatcher::new(live.clone()).unwrap();
        let handle = watcher.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        write(dir.path(), "b.ts", "export function (((\n");
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(live.current().names().collect::<Vec<_>>(), ["one"]);
        handle.abort();
    }

    #[test]
    fn rw_03_requires_root() {
        let live = LiveRegistry::new(Registry::empty());
        assert!(matches!(
            RegistryWatcher::new(live),
            Err(WatchError::NoRoot)
        ));
    }
}
