//! End-to-end coverage across a handful of linked ranks, driven entirely
//! over the in-memory `ChannelOverlay` so no real sockets are needed.
//! Mirrors the concrete scenarios and invariants the component design
//! calls out for the router, module host, and runlevel executor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use tbon_broker::builtin::cmb::{CmbService, PingRequest, PingResponse};
use tbon_broker::error::BrokerError;
use tbon_broker::message::{Message, NODEID_ANY};
use tbon_broker::module::ModuleMain;
use tbon_broker::overlay::ChannelOverlay;
use tbon_broker::router::{ModuleFactory, Router};
use tbon_broker::runlevel::{Level, RunlevelConfig, RunlevelExecutor};
use tbon_broker::shutdown::ShutdownController;

/// Wire `child`'s parent link to `parent`'s child slot for `child_rank`,
/// spawning the relay task a real two-socket overlay would otherwise do
/// for free inside one background task.
fn link(parent: &mut ChannelOverlay, child: &mut ChannelOverlay, child_rank: u32) {
    let (down_tx, down_rx) = mpsc::channel::<Message>(32);
    let tagged_up_tx = parent.add_child(child_rank, down_tx);
    let (up_tx, mut up_rx) = mpsc::channel::<Message>(32);
    child.set_parent_link(up_tx, down_rx);
    tokio::spawn(async move {
        while let Some(msg) = up_rx.recv().await {
            if tagged_up_tx.send((child_rank, msg)).await.is_err() {
                break;
            }
        }
    });
}

/// Pump one rank's overlay into its router for as long as the test runs,
/// the same `tokio::select!` shape `Broker::run`'s reactor loop uses.
fn drive(router: Arc<Router>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let has_parent = router.overlay.parent_of_self().is_some();
        let has_children = !router.overlay.children_of_self().is_empty();
        loop {
            tokio::select! {
                res = router.overlay.recv_parent(), if has_parent => {
                    match res {
                        Ok(msg) => { let _ = router.dispatch(msg).await; }
                        Err(_) => break,
                    }
                }
                res = router.overlay.recv_child(), if has_children => {
                    match res {
                        Ok((_, msg)) => { let _ = router.dispatch(msg).await; }
                        Err(_) => break,
                    }
                }
                else => break,
            }
        }
    })
}

/// size=4, k=2: rank0 -> {rank1, rank2}, rank1 -> {rank3}.
fn build_s1_tree() -> (Arc<Router>, Arc<Router>, Arc<Router>) {
    let mut overlay0 = ChannelOverlay::new(0, 4, 2);
    let mut overlay1 = ChannelOverlay::new(1, 4, 2);
    let mut overlay3 = ChannelOverlay::new(3, 4, 2);

    link(&mut overlay0, &mut overlay1, 1);
    link(&mut overlay1, &mut overlay3, 3);

    let router0 = Router::new(Arc::new(overlay0));
    let router1 = Router::new(Arc::new(overlay1));
    let router3 = Router::new(Arc::new(overlay3));

    (router0, router1, router3)
}

/// S1: size=4, k=2. Rank 3 sends `cmb.ping` to nodeid=0; the response's
/// route should read root-first as the 3-hop path `[0, 1, 3]`.
#[tokio::test]
async fn s1_ping_across_three_ranks_returns_full_route() {
    let (router0, router1, router3) = build_s1_tree();
    router0.register_builtin("cmb", Arc::new(CmbService)).await.unwrap();

    let _d1 = drive(router1.clone());
    let _d3 = drive(router3.clone());

    let req = Message::request("cmb.ping", 0, 1, &PingRequest { seq: 99 }).unwrap();
    let resp = tokio::time::timeout(std::time::Duration::from_secs(2), router3.call(req))
        .await
        .expect("ping round trip timed out")
        .unwrap();

    let decoded: PingResponse = resp.decode().unwrap();
    assert_eq!(decoded.seq, 99);
    assert_eq!(decoded.route, vec![0, 1, 3]);
}

/// Invariant 4 (route-stack balance): the RESPONSE that reaches the
/// original requester always has an empty route stack.
#[tokio::test]
async fn response_route_is_empty_at_the_originator() {
    let (router0, router1, router3) = build_s1_tree();
    router0.register_builtin("cmb", Arc::new(CmbService)).await.unwrap();
    let _d1 = drive(router1.clone());
    let _d3 = drive(router3.clone());

    let req = Message::request("cmb.ping", 0, 1, &PingRequest { seq: 1 }).unwrap();
    let resp = tokio::time::timeout(std::time::Duration::from_secs(2), router3.call(req))
        .await
        .unwrap()
        .unwrap();
    assert!(resp.route.is_empty());
}

struct Echo;

#[async_trait::async_trait]
impl ModuleMain for Echo {
    async fn main(&self, mut inbox: mpsc::Receiver<Message>, outbox: mpsc::Sender<Message>, ready: oneshot::Sender<()>) -> i32 {
        let _ = ready.send(());
        while let Some(msg) = inbox.recv().await {
            let reply = Message::response_to(&msg, &"pong".to_string()).unwrap();
            if outbox.send(reply).await.is_err() {
                break;
            }
        }
        0
    }
}

/// S2: size=2, k=2. `insmod` a module, then `rmmod` it twice — the second
/// call must report `not_found`.
#[tokio::test]
async fn s2_insmod_then_rmmod_then_rmmod_again_not_found() {
    let overlay = ChannelOverlay::new(0, 2, 2);
    let router = Router::new(Arc::new(overlay));

    router
        .register_factory(
            "connector-local",
            ModuleFactory {
                service_names: vec!["echo".to_string()],
                make: Box::new(|| Arc::new(Echo)),
            },
        )
        .await;

    let id = router.insmod("connector-local").await.unwrap();
    assert_eq!(router.service_owner("echo").await.unwrap(), tbon_broker::service::Owner::Module(id));

    let code = router.rmmod(id).await.unwrap();
    assert_eq!(code, 0);
    assert!(router.service_owner("echo").await.is_err());

    let second = router.rmmod(id).await;
    assert!(matches!(second, Err(BrokerError::NotFound(_))));
}

/// S4: a module-owned service forwards upstream from a rank where the
/// module isn't loaded, and dispatches locally where it is.
#[tokio::test]
async fn s4_request_forwards_upstream_without_the_module_dispatches_locally_with_it() {
    let mut overlay0 = ChannelOverlay::new(0, 2, 2);
    let mut overlay1 = ChannelOverlay::new(1, 2, 2);
    link(&mut overlay0, &mut overlay1, 1);

    let router0 = Router::new(Arc::new(overlay0));
    let router1 = Router::new(Arc::new(overlay1));

    router0
        .register_factory(
            "greeter",
            ModuleFactory {
                service_names: vec!["foo".to_string()],
                make: Box::new(|| Arc::new(Echo)),
            },
        )
        .await;
    router0.insmod("greeter").await.unwrap();

    let _d0 = drive(router0.clone());
    let _d1 = drive(router1.clone());

    // Rank 1 has no "foo" service: a NODEID_ANY request must forward
    // upstream to rank 0, where the module is loaded, and dispatch there.
    let req = Message::request("foo.bar", NODEID_ANY, 1, &()).unwrap();
    let resp = tokio::time::timeout(std::time::Duration::from_secs(2), router1.call(req))
        .await
        .expect("request did not resolve in time")
        .unwrap();
    assert_eq!(resp.decode::<String>().unwrap(), "pong");
}

/// S3: size=4, k=2. An event published at the leaf rank 3 funnels upstream,
/// gets sequenced at the root, and comes back down to every subscriber —
/// including a resend of the same wire message, which must be dropped.
#[tokio::test]
async fn s3_leaf_published_event_is_sequenced_at_root_and_multicast_down() {
    let (router0, router1, router3) = build_s1_tree();
    let _d0 = drive(router0.clone());
    let _d1 = drive(router1.clone());

    let (tx0, mut rx0) = mpsc::channel(8);
    router0.events.subscribe("temp.", tx0);

    router3.events.publish(&router3, "temp.reading", &7i32).await.unwrap();

    let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), rx0.recv())
        .await
        .expect("event did not reach the root subscriber")
        .unwrap();
    assert_eq!(delivered.sequence, 1);
    assert_eq!(delivered.decode::<i32>().unwrap(), 7);

    // Root re-delivers the same already-sequenced event downward (as if
    // rank 1 had retried); rank 0's own dedup must drop it rather than
    // re-notify the subscriber a second time.
    router0.events.receive(&router0, delivered.clone()).await.unwrap();
    assert!(rx0.try_recv().is_err());
}

/// S5: a shutdown request armed mid-flight must stop the reactor loop and
/// report the requested exit code, the same shape `Broker::run`'s select
/// over `shutdown.wait()` uses in production.
#[tokio::test]
async fn s5_armed_shutdown_stops_the_reactor_with_its_exit_code() {
    let overlay = ChannelOverlay::new(0, 1, 2);
    let router = Router::new(Arc::new(overlay));
    let shutdown = ShutdownController::new();

    let loop_shutdown = shutdown.clone();
    let loop_router = router.clone();
    let reactor = tokio::spawn(async move {
        loop {
            tokio::select! {
                req = loop_shutdown.wait() => break req.rc,
                res = loop_router.overlay.recv_parent(), if false => {
                    let _: Result<Message, BrokerError> = res;
                    unreachable!("rank 0 has no parent");
                }
            }
        }
    });

    shutdown.arm(3, "test requested shutdown").await;

    let rc = tokio::time::timeout(std::time::Duration::from_secs(2), reactor)
        .await
        .expect("reactor did not stop after shutdown was armed")
        .unwrap();
    assert_eq!(rc, 3);
}

/// S6: rc1 exits non-zero; the runlevel executor must refuse to advance
/// past it (rc2 is skipped by the caller, matching the broker's shutdown
/// path which jumps straight to rc3 on a failed bootstrap sequence).
#[tokio::test]
async fn s6_failed_rc1_does_not_advance_the_runlevel() {
    let config = RunlevelConfig {
        rc1: Some(vec!["false".to_string()]),
        rc2: Some(vec!["true".to_string()]),
        rc3: Some(vec!["true".to_string()]),
    };
    let executor = RunlevelExecutor::new(config);

    let rc1_code = executor.run(Level::Rc1).await.unwrap();
    assert_ne!(rc1_code, 0);

    // rc2 was never run: jumping straight to rc3 is still a forward
    // (monotonic) transition and must succeed.
    let rc3_code = executor.run(Level::Rc3).await.unwrap();
    assert_eq!(rc3_code, 0);
}
