//! Shutdown on SIGTERM / SIGINT (Ctrl+C on non-unix targets).
//!
//! Stopping only ends the accept loop; connections in flight are dropped
//! with the runtime, which tears their sessions down.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

/// Cloneable shutdown latch. Records what triggered it.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<&'static str>>>,
    rx: watch::Receiver<Option<&'static str>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Spawns a task that trips the latch on the first termination signal.
    pub fn listen_for_signals(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            match next_signal().await {
                Ok(name) => this.trigger(name),
                Err(e) => error!(error = %e, "Failed to install signal handlers"),
            }
        });
    }

    /// Trips the latch. Later triggers keep the first reason.
    pub fn trigger(&self, reason: &'static str) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            info!(reason, "Shutting down");
            *current = Some(reason);
            true
        });
    }

    /// What tripped the latch, if anything has.
    pub fn reason(&self) -> Option<&'static str> {
        *self.rx.borrow()
    }

    /// Resolves once the latch is tripped.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so this only returns on a trigger.
        let _ = rx.wait_for(Option::is_some).await;
    }
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_reason_wins() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.reason(), None);
        shutdown.trigger("test");
        shutdown.trigger("again");
        assert_eq!(shutdown.reason(), Some("test"));
    }

    #[tokio::test]
    async fn wait_resolves_for_every_clone() {
        let shutdown = Shutdown::new();
        let remote = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.trigger("remote");
        });

        let waited = tokio::time::timeout(Duration::from_millis(500), shutdown.wait()).await;
        assert!(waited.is_ok());
        assert_eq!(shutdown.reason(), Some("remote"));
    }

    #[tokio::test]
    async fn run_until_shutdown_returns() {
        use crate::{CameraServer, ServerConfig, SimulatedCamera};

        let server = CameraServer::bind(ServerConfig::ephemeral(), SimulatedCamera::new())
            .await
            .unwrap();
        let shutdown = Shutdown::new();
        shutdown.trigger("test");

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            server.run_until_shutdown(shutdown.wait()),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
