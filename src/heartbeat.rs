//! Heartbeat (C6): the root's periodic `hb` EVENT, fanned out through the
//! normal event path so every rank's idle-peer tracking has a steady
//! pulse to key off even when no application traffic is flowing (§4.6).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::info;

use crate::router::Router;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub epoch: u64,
}

/// Spawn the root's heartbeat ticker. No-op (returns a handle that exits
/// immediately) on any non-root rank — heartbeats only ever originate at
/// the root, following the same downward multicast every other event
/// uses.
pub fn spawn_heartbeat(router: Arc<Router>, interval: Duration, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if router.overlay.parent_of_self().is_some() {
            return;
        }
        info!(interval = ?interval, "heartbeat loop starting at root");
        let mut ticker = tokio::time::interval(interval);
        let mut epoch: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    epoch += 1;
                    if let Err(e) = router.events.publish(&router, "hb", &Heartbeat { epoch }).await {
                        tracing::warn!(error = %e, "failed to publish heartbeat");
                    }
                }
                _ = shutdown.notified() => break,
            }
        }
        info!("heartbeat loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::ChannelOverlay;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn heartbeat_publishes_events_at_root() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        let (tx, mut rx) = mpsc::channel(8);
        router.events.subscribe("hb", tx);

        let shutdown = Arc::new(Notify::new());
        let handle = spawn_heartbeat(router.clone(), Duration::from_millis(10), shutdown.clone());

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("heartbeat did not fire in time")
            .unwrap();
        assert_eq!(received.topic, "hb");

        shutdown.notify_waiters();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn heartbeat_is_a_noop_on_non_root_ranks() {
        let router = Router::new(Arc::new(ChannelOverlay::new(1, 4, 2)));
        let shutdown = Arc::new(Notify::new());
        let handle = spawn_heartbeat(router, Duration::from_millis(10), shutdown);
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("non-root heartbeat task should exit immediately")
            .unwrap();
    }
}
