//! `cmb.*`: the broker's own diagnostic and control surface — ping,
//! hello, peer listing, module management, resource usage, and the
//! heap-tracing toggle. All multiplexed under one `"cmb"` service
//! registration, the same way the real broker groups its built-ins.

use serde::{Deserialize, Serialize};

use tracing::error;

use crate::error::BrokerError;
use crate::hello::HelloPayload;
use crate::message::{hop_as_rank, rank_hop, Message};
use crate::router::{BuiltinService, Router};

#[derive(Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub seq: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub seq: u32,
    /// The ranks this REQUEST's route stack passed through, root-first.
    /// Chosen as a rank vector rather than a delimited hop string: ranks
    /// are already `u32` everywhere else in this crate, so a string
    /// round-trip would only exist to be parsed straight back.
    pub route: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LsmodEntry {
    pub id: u64,
    pub name: String,
    pub services: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsmodRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RmmodRequest {
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubRequest {
    pub topic: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PanicRequest {
    pub reason: String,
}

/// Mirrors the fixed field set `getrusage(2)` returns; `heaptrace.c`-style
/// ENOSYS behavior below means none of these are ever anything but zero
/// without a platform-specific accounting backend wired in.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Rusage {
    pub utime: f64,
    pub stime: f64,
    pub maxrss: i64,
    pub ixrss: i64,
    pub idrss: i64,
    pub isrss: i64,
    pub minflt: i64,
    pub majflt: i64,
    pub nswap: i64,
    pub inblock: i64,
    pub oublock: i64,
    pub msgsnd: i64,
    pub msgrcv: i64,
    pub nsignals: i64,
    pub nvcsw: i64,
    pub nivcsw: i64,
}

/// `cmb.sub`/`cmb.unsub` act "on behalf of the sending module" — resolve
/// that module from the router-stamped origin rather than trusting a
/// caller-supplied id, so one module can't subscribe or unsubscribe on
/// another's behalf.
async fn origin_module_handle(router: &Router, msg: &Message) -> Result<std::sync::Arc<crate::module::ModuleHandle>, BrokerError> {
    let module_id = msg
        .origin_module
        .ok_or_else(|| BrokerError::PermissionDenied(format!("{} requires a module origin", msg.topic)))?;
    router
        .module(module_id)
        .await
        .ok_or_else(|| BrokerError::NotFound(format!("module {module_id}")))
}

pub struct CmbService;

#[async_trait::async_trait]
impl BuiltinService for CmbService {
    async fn call(&self, router: &Router, msg: &Message) -> Result<Message, BrokerError> {
        match msg.topic.as_str() {
            "cmb.ping" => {
                let req: PingRequest = msg.decode()?;
                // `msg.route` holds each forwarding rank's own push, oldest
                // (the original sender) first; prepend this rank — where
                // the REQUEST turns around — and reverse to read root-first.
                let mut route = vec![router.rank()];
                route.extend(msg.route.iter().rev().filter_map(|h| hop_as_rank(h)));
                Message::response_to(msg, &PingResponse { seq: req.seq, route })
            }
            "cmb.hello" => {
                let req: HelloPayload = msg.decode()?;
                // Registered identically at every rank, so a row-2 hit
                // here never falls through to the parent on its own —
                // forward by hand until the root is reached, which is
                // where the hello is actually recorded.
                if router.overlay.parent_of_self().is_some() {
                    let mut fwd = msg.clone();
                    fwd.push_route(rank_hop(router.rank()));
                    router.overlay.send_parent(fwd).await?;
                } else {
                    router.record_hello(req.rank);
                }
                Message::response_to(msg, &())
            }
            "cmb.hello.count" => Message::response_to(msg, &router.hello.count()),
            "cmb.lspeer" => {
                let peers: Vec<(u32, u64)> = router
                    .overlay
                    .lspeer_encode()
                    .into_iter()
                    .map(|p| (p.rank, p.idle.as_millis() as u64))
                    .collect();
                Message::response_to(msg, &peers)
            }
            "cmb.insmod" => {
                let req: InsmodRequest = msg.decode()?;
                let id = router.insmod(&req.name).await?;
                Message::response_to(msg, &id)
            }
            "cmb.rmmod" => {
                let req: RmmodRequest = msg.decode()?;
                let code = router.rmmod(req.id).await?;
                Message::response_to(msg, &code)
            }
            "cmb.lsmod" => {
                let entries: Vec<LsmodEntry> = router
                    .lsmod()
                    .await
                    .into_iter()
                    .map(|(id, name, services)| LsmodEntry { id, name, services })
                    .collect();
                Message::response_to(msg, &entries)
            }
            "cmb.rusage" => Message::response_to(msg, &Rusage::default()),
            "cmb.heaptrace" => Err(BrokerError::NotImplemented(
                "heap tracing requires a tcmalloc-linked build, not available here".into(),
            )),
            "cmb.sub" => {
                let req: SubRequest = msg.decode()?;
                let handle = origin_module_handle(router, msg).await?;
                router.events.subscribe(req.topic.clone(), handle.inbox_sender());
                handle.subscriptions.lock().await.push(req.topic);
                Message::response_to(msg, &())
            }
            "cmb.unsub" => {
                let req: SubRequest = msg.decode()?;
                let handle = origin_module_handle(router, msg).await?;
                router.events.unsubscribe(&req.topic);
                handle.subscriptions.lock().await.retain(|t| *t != req.topic);
                Message::response_to(msg, &())
            }
            "cmb.panic" => {
                let req: PanicRequest = msg.decode()?;
                error!(reason = %req.reason, "cmb.panic requested, exiting un-gracefully");
                std::process::exit(1);
            }
            "cmb.disconnect" => {
                // No module in this core owns OS subprocesses on a
                // client's behalf, so there is nothing to terminate here;
                // acknowledged as a no-op rather than faked.
                Message::response_to(msg, &())
            }
            other => Err(BrokerError::NoService(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NODEID_ANY;
    use crate::overlay::ChannelOverlay;
    use std::sync::Arc;

    #[tokio::test]
    async fn ping_echoes_seq_and_route() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        let mut req = Message::request("cmb.ping", NODEID_ANY, 1, &PingRequest { seq: 9 }).unwrap();
        req.push_route(crate::message::rank_hop(2));
        req.push_route(crate::message::rank_hop(1));

        let resp = CmbService.call(&router, &req).await.unwrap();
        let decoded: PingResponse = resp.decode().unwrap();
        assert_eq!(decoded.seq, 9);
        assert_eq!(decoded.route, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn hello_records_rank_in_tracker() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 2, 2)));
        let req = Message::request("cmb.hello", NODEID_ANY, 0, &HelloPayload { rank: 1 }).unwrap();
        CmbService.call(&router, &req).await.unwrap();
        assert_eq!(router.hello.count(), 1);
    }

    #[tokio::test]
    async fn heaptrace_is_not_implemented_by_default() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        let req = Message::request("cmb.heaptrace", NODEID_ANY, 0, &()).unwrap();
        assert!(matches!(
            CmbService.call(&router, &req).await,
            Err(BrokerError::NotImplemented(_))
        ));
    }

    struct Noop;

    #[async_trait::async_trait]
    impl crate::module::ModuleMain for Noop {
        async fn main(
            &self,
            mut inbox: tokio::sync::mpsc::Receiver<Message>,
            _outbox: tokio::sync::mpsc::Sender<Message>,
            ready: tokio::sync::oneshot::Sender<()>,
        ) -> i32 {
            let _ = ready.send(());
            while inbox.recv().await.is_some() {}
            0
        }
    }

    #[tokio::test]
    async fn sub_registers_and_unsub_removes_the_module_subscription() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        router
            .register_factory(
                "noop",
                crate::router::ModuleFactory {
                    service_names: vec![],
                    make: Box::new(|| Arc::new(Noop)),
                },
            )
            .await;
        let id = router.insmod("noop").await.unwrap();

        let mut sub = Message::request("cmb.sub", NODEID_ANY, 0, &SubRequest { topic: "x.".into() }).unwrap();
        sub.origin_module = Some(id);
        CmbService.call(&router, &sub).await.unwrap();

        let handle = router.module(id).await.unwrap();
        assert_eq!(*handle.subscriptions.lock().await, vec!["x.".to_string()]);

        let mut unsub = Message::request("cmb.unsub", NODEID_ANY, 0, &SubRequest { topic: "x.".into() }).unwrap();
        unsub.origin_module = Some(id);
        CmbService.call(&router, &unsub).await.unwrap();
        assert!(handle.subscriptions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn sub_without_a_module_origin_is_permission_denied() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        let req = Message::request("cmb.sub", NODEID_ANY, 0, &SubRequest { topic: "x.".into() }).unwrap();
        assert!(matches!(
            CmbService.call(&router, &req).await,
            Err(BrokerError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_is_acknowledged_as_a_noop() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        let req = Message::request("cmb.disconnect", NODEID_ANY, 0, &()).unwrap();
        CmbService.call(&router, &req).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_cmb_verb_is_no_service() {
        let router = Router::new(Arc::new(ChannelOverlay::new(0, 1, 2)));
        let req = Message::request("cmb.frobnicate", NODEID_ANY, 0, &()).unwrap();
        assert!(matches!(
            CmbService.call(&router, &req).await,
            Err(BrokerError::NoService(_))
        ));
    }
}
