//! Shutdown sequencing (C11): arms a grace period once a runlevel
//! requests shutdown, and turns OS signals into the same request so an
//! operator's Ctrl-C and an in-band `cmb.shutdown` agree on one path
//! (§4.11).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

/// Why the broker is shutting down.
#[derive(Debug, Clone)]
pub struct ShutdownRequest {
    pub rc: i32,
    pub reason: String,
}

/// Shared shutdown state: a request channel plus a notify any waiter can
/// subscribe to once a request has been armed.
pub struct ShutdownController {
    tx: mpsc::Sender<ShutdownRequest>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<ShutdownRequest>>>,
    armed: Notify,
}

impl ShutdownController {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(4);
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
            armed: Notify::new(),
        })
    }

    /// Request shutdown with the given exit code and human-readable
    /// reason. Safe to call more than once; only the first request wins.
    pub async fn arm(&self, rc: i32, reason: impl Into<String>) {
        let reason = reason.into();
        info!(rc, reason = %reason, "shutdown armed");
        let _ = self.tx.send(ShutdownRequest { rc, reason }).await;
        self.armed.notify_waiters();
    }

    /// Wait for the first shutdown request and return it. Consumes the
    /// internal receiver — call this from exactly one place (the
    /// top-level reactor).
    pub async fn wait(&self) -> ShutdownRequest {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await.expect("shutdown sender never dropped while held"),
            None => {
                // Already consumed by a previous call; wait forever.
                drop(guard);
                std::future::pending().await
            }
        }
    }

    /// Install a `SIGINT`/`SIGTERM` listener that arms shutdown with exit
    /// code 0 and a descriptive reason, mirroring the signal handling
    /// every long-running worker in this codebase installs.
    #[cfg(unix)]
    pub fn install_signal_handler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigint.recv() => controller.arm(0, "SIGINT received").await,
                _ = sigterm.recv() => controller.arm(0, "SIGTERM received").await,
            }
        })
    }

    /// Grace timer: if shutdown hasn't already happened within `grace`,
    /// arm it forcibly with a nonzero exit code.
    pub fn arm_after(self: &Arc<Self>, grace: Duration, rc: i32, reason: impl Into<String> + Send + 'static) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            controller.arm(rc, reason).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn arm_then_wait_delivers_the_request() {
        let controller = ShutdownController::new();
        controller.arm(7, "test").await;
        let req = controller.wait().await;
        assert_eq!(req.rc, 7);
        assert_eq!(req.reason, "test");
    }

    #[tokio::test]
    async fn arm_after_fires_once_grace_elapses() {
        let controller = ShutdownController::new();
        let _handle = controller.arm_after(Duration::from_millis(10), 1, "grace expired");
        let req = tokio::time::timeout(Duration::from_secs(1), controller.wait())
            .await
            .unwrap();
        assert_eq!(req.rc, 1);
    }
}
