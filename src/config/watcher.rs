//! Configuration file watcher for backend hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use notify::{Watcher, RecursiveMode, Event, RecommendedWatcher, Config};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;
use crate::proxy::ProxyManager;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (Self {
            path: path.to_path_buf(),
            update_tx,
        }, update_rx)
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(move |res: notify::Result<Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match load_config(&path) {
                        Ok(new_config) => {
                            tracing::info!(path = ?path, "Config file changed, reloading backends");
                            let _ = tx.send(new_config);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config, keeping current backends");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            }
        }, Config::default().with_poll_interval(Duration::from_secs(2)))?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Apply configuration updates to the running manager until shutdown.
pub fn spawn_reload_loop(
    manager: Arc<ProxyManager>,
    mut updates: mpsc::UnboundedReceiver<ProxyConfig>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(config) = update else { break };
                    let summary = manager.reconcile_backends(&config.backends);
                    tracing::info!(
                        added = summary.added,
                        removed = summary.removed,
                        updated = summary.updated,
                        "Backend set reconciled"
                    );
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
