//! Router (C9): the message-type dispatch table at the center of every
//! broker. §4.9 describes five dispatch branches; this module is the
//! only place that branches on [`MessageType`] for day-to-day traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, warn};

use crate::attr::AttrStore;
use crate::error::BrokerError;
use crate::events::EventSequencer;
use crate::hello::HelloTracker;
use crate::message::{hop_as_module, hop_as_rank, rank_hop, Flags, Message, MessageType, NODEID_ANY};
use crate::module::{ModuleHandle, ModuleMain, ModuleOutcome};
use crate::overlay::Overlay;
use crate::service::{Owner, ServiceSwitch};
use crate::topology::child_gateway;

/// A statically compiled module, registered under a name `insmod` can
/// instantiate by. Modules here aren't dynamically loaded `.so` files —
/// they're a factory plus the service names the module wants bound to it
/// once it's running.
pub struct ModuleFactory {
    pub service_names: Vec<String>,
    pub make: Box<dyn Fn() -> Arc<dyn ModuleMain> + Send + Sync>,
}

/// A broker-resident built-in handler (C13), registered under
/// [`Owner::Broker`]. Implementations are synchronous producers of a
/// response; streaming built-ins send extra RESPONSEs directly through
/// the router instead of returning one here.
#[async_trait::async_trait]
pub trait BuiltinService: Send + Sync {
    async fn call(&self, router: &Router, msg: &Message) -> Result<Message, BrokerError>;
}

/// The shared, reactor-owned routing state for one broker rank.
pub struct Router {
    pub overlay: Arc<dyn Overlay>,
    services: Mutex<ServiceSwitch>,
    builtins: Mutex<HashMap<String, Arc<dyn BuiltinService>>>,
    modules: Mutex<HashMap<u64, Arc<ModuleHandle>>>,
    factories: Mutex<HashMap<String, ModuleFactory>>,
    module_names: Mutex<HashMap<u64, String>>,
    next_module_id: AtomicU64,
    pub attrs: Mutex<AttrStore>,
    pub events: EventSequencer,
    pub hello: HelloTracker,
    /// Fires once every rank has checked in via the hello protocol, the
    /// root's trigger to start running runlevel 1.
    pub hello_complete: Notify,
    /// Outstanding locally-originated requests, keyed by the matchtag this
    /// broker assigned, waiting for their RESPONSE to unwind back to an
    /// empty route stack.
    pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    next_matchtag: AtomicU32,
    /// Self-reference so a module's outbox can be pumped back into
    /// `dispatch` from a task spawned by `&self` methods, without every
    /// caller having to thread an `Arc<Router>` through.
    self_ref: Weak<Router>,
}

impl Router {
    pub fn new(overlay: Arc<dyn Overlay>) -> Arc<Self> {
        let root = overlay.parent_of_self().is_none();
        let size = overlay.size();
        Arc::new_cyclic(|weak| Self {
            overlay,
            services: Mutex::new(ServiceSwitch::new()),
            builtins: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            factories: Mutex::new(HashMap::new()),
            module_names: Mutex::new(HashMap::new()),
            next_module_id: AtomicU64::new(1),
            attrs: Mutex::new(AttrStore::new()),
            events: EventSequencer::new(root),
            hello: HelloTracker::new(size),
            hello_complete: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            next_matchtag: AtomicU32::new(1),
            self_ref: weak.clone(),
        })
    }

    pub fn rank(&self) -> u32 {
        self.overlay.rank()
    }

    pub async fn register_builtin(&self, name: &str, handler: Arc<dyn BuiltinService>) -> Result<(), BrokerError> {
        self.services.lock().await.register(name, Owner::Broker)?;
        self.builtins.lock().await.insert(name.to_string(), handler);
        Ok(())
    }

    /// Dynamically register a service name at runtime (the `service.add`
    /// built-in), as opposed to the bulk registration a module performs
    /// when it's first loaded.
    pub async fn add_service(&self, name: &str, owner: Owner) -> Result<(), BrokerError> {
        self.services.lock().await.register(name, owner)
    }

    pub async fn remove_service(&self, name: &str) -> Result<(), BrokerError> {
        self.services.lock().await.unregister(name)
    }

    pub async fn service_owner(&self, name: &str) -> Result<Owner, BrokerError> {
        self.services.lock().await.lookup(name)
    }

    pub async fn service_names_by_owner(&self, module_id: u64) -> Vec<String> {
        self.services.lock().await.names_by_owner(module_id)
    }

    pub async fn register_module(&self, handle: Arc<ModuleHandle>, service_names: &[&str]) -> Result<(), BrokerError> {
        let mut services = self.services.lock().await;
        for name in service_names {
            services.register(name, Owner::Module(handle.id))?;
        }
        drop(services);
        self.modules.lock().await.insert(handle.id, handle.clone());
        self.spawn_module_pump(handle);
        Ok(())
    }

    /// Drain a module's outbox back into `dispatch`, the same way the
    /// overlay's recv loops feed inbound wire traffic in (§4.8). Runs for
    /// the module's lifetime; exits once the outbox closes on finalize.
    fn spawn_module_pump(&self, handle: Arc<ModuleHandle>) {
        let Some(router) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(mut msg) = handle.recv().await {
                if msg.msg_type == MessageType::Request {
                    msg.origin_module = Some(handle.id);
                }
                if let Err(e) = router.dispatch(msg).await {
                    warn!(module = %handle.name, error = %e, "failed dispatching message from module outbox");
                }
            }
        });
    }

    /// Tear down every service a module owns and drop its handle, in one
    /// critical section so no message can be dispatched to a half-removed
    /// module (§4.8 invariant #3).
    pub async fn retire_module(&self, module_id: u64) -> Vec<String> {
        let mut services = self.services.lock().await;
        let removed = services.unregister_all_by_owner(module_id);
        drop(services);
        self.modules.lock().await.remove(&module_id);
        removed
    }

    pub async fn module(&self, module_id: u64) -> Option<Arc<ModuleHandle>> {
        self.modules.lock().await.get(&module_id).cloned()
    }

    pub async fn module_ids(&self) -> Vec<u64> {
        self.modules.lock().await.keys().copied().collect()
    }

    /// Register a statically compiled module under `name` so `insmod` can
    /// later instantiate it.
    pub async fn register_factory(&self, name: &str, factory: ModuleFactory) {
        self.factories.lock().await.insert(name.to_string(), factory);
    }

    /// `cmb.insmod`: instantiate the factory registered under `name`,
    /// spawn it, and bind its declared services. Returns the new module's
    /// id once it reaches `Running`; if it exits before that, its own
    /// errno comes back as [`BrokerError::ModuleLoadFailed`].
    pub async fn insmod(&self, name: &str) -> Result<u64, BrokerError> {
        let (service_names, main) = {
            let factories = self.factories.lock().await;
            let factory = factories
                .get(name)
                .ok_or_else(|| BrokerError::NotFound(format!("no module named '{name}'")))?;
            (factory.service_names.clone(), (factory.make)())
        };

        let id = self.next_module_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(ModuleHandle::spawn(id, name, main));
        let names: Vec<&str> = service_names.iter().map(String::as_str).collect();
        if let Err(e) = self.register_module(handle.clone(), &names).await {
            // Roll back: the module is already spawned but its services
            // couldn't all be bound, so it's not reachable — finalize it.
            let _ = handle.finalize_and_join().await;
            return Err(e);
        }
        self.module_names.lock().await.insert(id, name.to_string());
        match handle.wait_for_running_or_exit().await {
            ModuleOutcome::Running => Ok(id),
            ModuleOutcome::Exited(code) => {
                self.retire_module(id).await;
                self.module_names.lock().await.remove(&id);
                Err(BrokerError::ModuleLoadFailed(name.to_string(), code))
            }
        }
    }

    /// `cmb.rmmod`: finalize the module, then atomically tear down every
    /// service it owned once it has reached `Exited` (invariant #3).
    pub async fn rmmod(&self, id: u64) -> Result<i32, BrokerError> {
        let handle = self
            .module(id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("module {id}")))?;
        let code = handle.finalize_and_join().await?;
        self.retire_module(id).await;
        self.module_names.lock().await.remove(&id);
        Ok(code)
    }

    /// `cmb.lsmod`: `(id, name, services)` for every loaded module.
    pub async fn lsmod(&self) -> Vec<(u64, String, Vec<String>)> {
        let names = self.module_names.lock().await.clone();
        let mut out = Vec::new();
        for (id, name) in names {
            let services = self.service_names_by_owner(id).await;
            out.push((id, name, services));
        }
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    /// Record that `rank` has said hello, waking anyone waiting on
    /// [`Router::hello_complete`] the moment every rank has checked in.
    pub fn record_hello(&self, rank: u32) {
        if self.hello.record(rank) {
            self.hello_complete.notify_waiters();
        }
    }

    pub fn fresh_matchtag(&self) -> u32 {
        self.next_matchtag.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `msg` as a locally-originated REQUEST and await its RESPONSE,
    /// the entry point built-ins use when they themselves need to call
    /// another service (e.g. `rmmod` calling back into `service.remove`).
    pub async fn call(&self, mut msg: Message) -> Result<Message, BrokerError> {
        let matchtag = self.fresh_matchtag();
        msg.matchtag = matchtag;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(matchtag, tx);
        self.dispatch(msg).await?;
        let resp = rx
            .await
            .map_err(|_| BrokerError::Transport("request dropped before response arrived".into()))?;
        if resp.flags.contains(crate::message::Flags::ERROR) {
            let payload: crate::message::ErrorPayload = resp.decode()?;
            return Err(BrokerError::Remote {
                kind: payload.kind,
                reason: payload.reason,
            });
        }
        Ok(resp)
    }

    /// Central entry point: every message arriving from the overlay, a
    /// module's outbox, or a local client funnels through here.
    pub async fn dispatch(&self, msg: Message) -> Result<(), BrokerError> {
        match msg.msg_type {
            MessageType::Request => self.dispatch_request(msg).await,
            MessageType::Response => self.dispatch_response(msg).await,
            MessageType::Event => self.events.receive(self, msg).await,
            MessageType::Keepalive => self.dispatch_keepalive(msg).await,
        }
    }

    /// §4.9.1: REQUEST dispatch. Four rows keyed off `flags.UPSTREAM` and
    /// `nodeid`:
    /// 1. `UPSTREAM && nodeid == self_rank` — this rank is the request's
    ///    point of origin; always forward to the parent, never dispatch
    ///    here (`no_host` if there is no parent).
    /// 2. `UPSTREAM && nodeid != self_rank` — forwarded past its origin;
    ///    try the local service switch, fall back to the parent on a miss.
    /// 3. `nodeid == ANY` — same local-first, parent-fallback shape as row
    ///    2, without the upstream marker.
    /// 4. `nodeid == self_rank` — addressed here specifically; local only,
    ///    no fallback on a miss.
    /// Anything else names a different rank: route down through whichever
    /// child subtree contains it, or up otherwise.
    async fn dispatch_request(&self, mut msg: Message) -> Result<(), BrokerError> {
        let self_rank = self.rank();
        let has_parent = self.overlay.parent_of_self().is_some();

        if msg.flags.contains(Flags::UPSTREAM) && msg.nodeid == self_rank {
            if !has_parent {
                return self.respond_error(&msg, &BrokerError::NoHost).await;
            }
            msg.push_route(rank_hop(self_rank));
            return self.overlay.send_parent(msg).await;
        }

        if msg.flags.contains(Flags::UPSTREAM) || msg.nodeid == NODEID_ANY {
            return self.dispatch_local_or_upstream(msg, self_rank, has_parent).await;
        }

        if msg.nodeid == self_rank {
            let owner = {
                let services = self.services.lock().await;
                services.lookup(&msg.topic)
            };
            return match owner {
                Ok(owner) => self.dispatch_to_owner(owner, msg).await,
                Err(e) => self.respond_error(&msg, &e).await,
            };
        }

        if let Some(gateway) = child_gateway(self_rank, msg.nodeid, self.overlay.k(), self.overlay.size()) {
            // Reverse ROUTER convention: `send_child` already carries the
            // gateway out of band, so only this rank's own identity goes
            // on the stack — one push per hop, same as the upward case, so
            // a RESPONSE later unwinds it one pop per hop.
            msg.push_route(rank_hop(self_rank));
            return self.overlay.send_child(gateway, msg).await;
        }
        msg.push_route(rank_hop(self_rank));
        self.overlay.send_parent(msg).await
    }

    /// Rows 2 and 3 of §4.9.1: resolve locally by topic, falling back to
    /// the parent only on a service-switch miss.
    async fn dispatch_local_or_upstream(
        &self,
        mut msg: Message,
        self_rank: u32,
        has_parent: bool,
    ) -> Result<(), BrokerError> {
        let owner = {
            let services = self.services.lock().await;
            services.lookup(&msg.topic)
        };
        match owner {
            Ok(owner) => self.dispatch_to_owner(owner, msg).await,
            Err(BrokerError::NoService(_)) if has_parent => {
                msg.push_route(rank_hop(self_rank));
                self.overlay.send_parent(msg).await
            }
            Err(e) => self.respond_error(&msg, &e).await,
        }
    }

    async fn dispatch_to_owner(&self, owner: Owner, msg: Message) -> Result<(), BrokerError> {
        match owner {
            Owner::Broker => self.dispatch_to_builtin(msg).await,
            Owner::Module(id) => self.dispatch_to_module(id, msg).await,
        }
    }

    async fn dispatch_to_builtin(&self, msg: Message) -> Result<(), BrokerError> {
        let name = msg.service_name().to_string();
        let handler = self.builtins.lock().await.get(&name).cloned();
        match handler {
            Some(handler) => match handler.call(self, &msg).await {
                Ok(resp) => {
                    if msg.flags.contains(Flags::NORESPONSE) {
                        return Ok(());
                    }
                    self.dispatch_response(resp).await
                }
                Err(e) => self.respond_error(&msg, &e).await,
            },
            None => self.respond_error(&msg, &BrokerError::NoService(name)).await,
        }
    }

    async fn dispatch_to_module(&self, module_id: u64, msg: Message) -> Result<(), BrokerError> {
        let handle = self.modules.lock().await.get(&module_id).cloned();
        match handle {
            Some(handle) => handle.send(msg).await,
            None => self.respond_error(&msg, &BrokerError::NotFound(format!("module {module_id}"))).await,
        }
    }

    /// §4.9.2: RESPONSE dispatch. Pop the route stack: an empty pop means
    /// the response has unwound all the way home to the broker that
    /// originated the matching REQUEST. A rank hop that names this
    /// broker's own parent goes back up, not down — the route stack mixes
    /// both directions whenever the REQUEST's path bent at a rank other
    /// than the one now unwinding it. A hop that isn't a rank at all names
    /// a module this RESPONSE is headed to directly, bypassing the service
    /// switch.
    async fn dispatch_response(&self, mut msg: Message) -> Result<(), BrokerError> {
        match msg.pop_route() {
            None => self.deliver_response(msg).await,
            Some(hop) => {
                if let Some(rank) = hop_as_rank(&hop) {
                    if self.overlay.parent_of_self() == Some(rank) {
                        return self.overlay.send_parent(msg).await;
                    }
                    return self.overlay.send_child(rank, msg).await;
                }
                if let Some(module_id) = hop_as_module(&hop) {
                    if let Some(handle) = self.module(module_id).await {
                        return handle.send(msg).await;
                    }
                }
                warn!("dropping response with unroutable route hop");
                Ok(())
            }
        }
    }

    /// Complete a locally-pending `call()`, or forward upward one more hop
    /// if this rank didn't originate the request (route stack already
    /// empty but matchtag unknown — meaning the requester is this rank's
    /// parent, who pushed nothing because it dispatched by service name
    /// directly at rank 0's root-local service).
    async fn deliver_response(&self, msg: Message) -> Result<(), BrokerError> {
        let waiter = self.pending.lock().await.remove(&msg.matchtag);
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
                Ok(())
            }
            None => {
                debug!(matchtag = msg.matchtag, "response has no local waiter, dropping");
                Ok(())
            }
        }
    }

    async fn dispatch_keepalive(&self, msg: Message) -> Result<(), BrokerError> {
        if let Some(rank) = msg.route.last().and_then(|h| hop_as_rank(h)) {
            self.overlay.touch_child(rank);
        }
        Ok(())
    }

    pub async fn respond_error(&self, request: &Message, err: &BrokerError) -> Result<(), BrokerError> {
        if request.flags.contains(crate::message::Flags::NORESPONSE) {
            return Ok(());
        }
        let resp = Message::error_response_to(request, err)?;
        self.dispatch_response(resp).await
    }
}
