//! Top-level wiring: bootstraps one rank's overlay, router, and built-in
//! services, then runs the reactor loop until a shutdown is armed.
//!
//! The loop itself follows the teacher's `EventBroker::run` shape — a
//! `tokio::select!` over whichever sockets exist for this rank, with
//! shutdown checked as just another branch rather than a polled flag.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::builtin::attr::AttrService;
use crate::builtin::cmb::CmbService;
use crate::builtin::log::LogService;
use crate::builtin::service::ServiceService;
use crate::config::BrokerConfig;
use crate::content::NullContentService;
use crate::error::BrokerError;
use crate::hello::send_hello;
use crate::heartbeat::spawn_heartbeat;
use crate::overlay::{Overlay, ZmqOverlay};
use crate::router::Router;
use crate::runlevel::{Level, RunlevelExecutor};
use crate::shutdown::ShutdownController;

pub struct Broker {
    pub router: Arc<Router>,
    config: BrokerConfig,
    shutdown: Arc<ShutdownController>,
    runlevel: Arc<RunlevelExecutor>,
}

impl Broker {
    /// Bind/connect this rank's overlay sockets, seed its attribute
    /// store, and register every built-in service (§4.4 bootstrap).
    pub async fn bootstrap(config: BrokerConfig) -> Result<Self, BrokerError> {
        let parent = config.parent_transport()?;
        let child_bind = config.child_bind_transport()?;

        let overlay = ZmqOverlay::wire_up(
            config.session.rank,
            config.session.size,
            config.session.k,
            parent.as_ref(),
            child_bind.as_ref(),
        )
        .await?;
        let router = Router::new(Arc::new(overlay));

        {
            let mut attrs = router.attrs.lock().await;
            attrs.add_immutable("rank", config.session.rank.to_string())?;
            attrs.add_immutable("size", config.session.size.to_string())?;
            attrs.add_immutable("tbon.k", config.session.k.to_string())?;
            attrs.add_immutable("rundir", config.session.rundir.clone())?;
        }

        router.register_builtin("cmb", Arc::new(CmbService)).await?;
        router.register_builtin("service", Arc::new(ServiceService)).await?;
        router.register_builtin("attr", Arc::new(AttrService)).await?;
        router.register_builtin("log", Arc::new(LogService)).await?;
        router.register_builtin("content", Arc::new(NullContentService)).await?;

        let runlevel = Arc::new(RunlevelExecutor::new(config.runlevel.clone().into()));

        Ok(Self {
            router,
            config,
            shutdown: ShutdownController::new(),
            runlevel,
        })
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownController> {
        self.shutdown.clone()
    }

    /// Run until a shutdown request is armed (by a signal, a grace timer,
    /// or an in-band request), returning the exit code to report.
    pub async fn run(&self) -> Result<i32, BrokerError> {
        send_hello(&self.router).await?;

        #[cfg(unix)]
        let _signal_handle = self.shutdown.install_signal_handler();

        let hb_shutdown = Arc::new(Notify::new());
        let _heartbeat_handle = spawn_heartbeat(
            self.router.clone(),
            Duration::from_secs(self.config.heartbeat.interval_secs),
            hb_shutdown.clone(),
        );

        let is_root = self.router.overlay.parent_of_self().is_none();
        let _runlevel_handle = if is_root {
            Some(self.spawn_runlevel_driver())
        } else {
            None
        };

        let has_parent = self.router.overlay.parent_of_self().is_some();
        let has_children = !self.router.overlay.children_of_self().is_empty();

        let rc = loop {
            tokio::select! {
                res = self.router.overlay.recv_parent(), if has_parent => {
                    match res {
                        Ok(msg) => { let _ = self.router.dispatch(msg).await; }
                        Err(e) => warn!(error = %e, "overlay parent recv failed"),
                    }
                }
                res = self.router.overlay.recv_child(), if has_children => {
                    match res {
                        Ok((_, msg)) => { let _ = self.router.dispatch(msg).await; }
                        Err(e) => warn!(error = %e, "overlay child recv failed"),
                    }
                }
                req = self.shutdown.wait() => {
                    info!(rc = req.rc, reason = %req.reason, "broker shutting down");
                    if is_root {
                        if let Err(e) = self.runlevel.run(Level::Rc3).await {
                            warn!(error = %e, "rc3 failed during shutdown");
                        }
                    }
                    break req.rc;
                }
            }
        };

        hb_shutdown.notify_waiters();
        Ok(rc)
    }

    /// Root-only: wait for every rank to say hello, then run rc1 and rc2
    /// in sequence (§4.5, §4.10).
    fn spawn_runlevel_driver(&self) -> tokio::task::JoinHandle<()> {
        let router = self.router.clone();
        let runlevel = self.runlevel.clone();
        tokio::spawn(async move {
            router.hello_complete.notified().await;
            info!("hello complete, running rc1");
            if let Err(e) = runlevel.run(Level::Rc1).await {
                warn!(error = %e, "rc1 failed");
                return;
            }
            info!("rc1 complete, running rc2");
            if let Err(e) = runlevel.run(Level::Rc2).await {
                warn!(error = %e, "rc2 failed");
            }
        })
    }
}
