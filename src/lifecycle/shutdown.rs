//! Shutdown coordination for the proxy.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to,
/// and keeps their handles so shutdown can wait for them.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Keep a background task's handle so [`complete`](Self::complete) can
    /// wait for it.
    pub fn track(&self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name, handle));
    }

    /// Signal shutdown and wait for every tracked task, each bounded by
    /// `timeout`. Tasks that overrun are aborted.
    pub async fn complete(&self, timeout: Duration) {
        self.trigger();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for (name, mut handle) in tasks {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(task = name, "Background task stopped"),
                Ok(Err(e)) => tracing::error!(task = name, error = %e, "Background task failed"),
                Err(_) => {
                    tracing::warn!(task = name, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
