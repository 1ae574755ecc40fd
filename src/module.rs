//! Module host (C8): the thread-per-module worker lifecycle.
//!
//! A module runs its own `tokio::select!` loop exactly like the teacher's
//! `WorkerRunner::run`, but reports four states instead of the teacher's
//! implicit started/stopped pair, because `insmod`/`rmmod` need to observe
//! the in-between states to decide whether their response can be sent
//! immediately or must be deferred (§4.8).

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::BrokerError;
use crate::message::Message;

/// A module's lifecycle state (§4.8). Transitions only move forward;
/// there is no path back to an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    Init = 0,
    Running = 1,
    Finalizing = 2,
    Exited = 3,
}

impl ModuleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Running,
            2 => Self::Finalizing,
            _ => Self::Exited,
        }
    }
}

/// User code loaded into a module slot. `main` owns the module's inbox and
/// must drain it until told to finalize; its return value becomes the
/// module's exit status (mirroring a `mod_main()` return code). `ready`
/// must be fired once initialization has succeeded and the module is about
/// to enter its serve loop — `main` returning without ever firing it is
/// the direct INIT -> EXITED failure transition (§4.8).
#[async_trait]
pub trait ModuleMain: Send + Sync {
    async fn main(&self, inbox: mpsc::Receiver<Message>, outbox: mpsc::Sender<Message>, ready: oneshot::Sender<()>) -> i32;
}

/// The outcome `insmod` cares about: did the module ever reach `Running`,
/// or did it exit (successfully or not) before getting there.
#[derive(Debug, Clone, Copy)]
pub enum ModuleOutcome {
    Running,
    Exited(i32),
}

/// A deferred response waiting on a state transition: `insmod` waits for
/// `Running`, `rmmod` waits for `Exited`.
struct Waiter {
    target: ModuleState,
    reply: oneshot::Sender<()>,
}

struct StateCell {
    state: AtomicU8,
    waiters: tokio::sync::Mutex<Vec<Waiter>>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ModuleState::Init as u8),
            waiters: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> ModuleState {
        ModuleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn advance_to(&self, next: ModuleState) {
        self.state.store(next as u8, Ordering::SeqCst);
        self.wake_ready(next).await;
    }
}

/// Handle the router and `cmb.*` built-ins use to talk to a running module.
pub struct ModuleHandle {
    pub id: u64,
    pub name: String,
    inbox_tx: mpsc::Sender<Message>,
    outbox_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    join_handle: tokio::sync::Mutex<Option<JoinHandle<i32>>>,
    state: Arc<StateCell>,
    reached_running: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
    transition: Arc<Notify>,
    /// Topic prefixes this module has registered via `cmb.sub`, tracked so
    /// `cmb.unsub` and module teardown can find what to remove.
    pub subscriptions: tokio::sync::Mutex<Vec<String>>,
}

impl ModuleHandle {
    /// Spawn `module` as its own task. `Running` is only entered once the
    /// module itself fires `ready`; if `main` returns first, the module
    /// never passes through `Running` at all — a direct INIT -> EXITED
    /// transition, observable by `wait_for_running_or_exit`.
    pub fn spawn(id: u64, name: impl Into<String>, module: Arc<dyn ModuleMain>) -> Self {
        let name = name.into();
        let (inbox_tx, inbox_rx) = mpsc::channel::<Message>(256);
        let (outbox_tx, outbox_rx) = mpsc::channel::<Message>(256);
        let state = Arc::new(StateCell::new());
        let reached_running = Arc::new(AtomicBool::new(false));
        let exit_code = Arc::new(AtomicI32::new(0));
        let transition = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        let run_state = Arc::clone(&state);
        let run_exit = Arc::clone(&exit_code);
        let run_transition = Arc::clone(&transition);
        let run_name = name.clone();
        let join_handle = tokio::spawn(async move {
            let code = module.main(inbox_rx, outbox_tx, ready_tx).await;
            run_exit.store(code, Ordering::SeqCst);
            run_state.advance_to(ModuleState::Finalizing).await;
            info!(module = %run_name, exit_code = code, "module finalizing");
            run_state.advance_to(ModuleState::Exited).await;
            run_transition.notify_waiters();
            code
        });

        let watch_state = Arc::clone(&state);
        let watch_reached = Arc::clone(&reached_running);
        let watch_transition = Arc::clone(&transition);
        let watch_name = name.clone();
        tokio::spawn(async move {
            if ready_rx.await.is_ok() {
                watch_state.advance_to(ModuleState::Running).await;
                watch_reached.store(true, Ordering::SeqCst);
                info!(module = %watch_name, "module entered running state");
                watch_transition.notify_waiters();
            }
        });

        Self {
            id,
            name,
            inbox_tx,
            outbox_rx: tokio::sync::Mutex::new(outbox_rx),
            join_handle: tokio::sync::Mutex::new(Some(join_handle)),
            state,
            reached_running,
            exit_code,
            transition,
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state.get()
    }

    pub async fn send(&self, msg: Message) -> Result<(), BrokerError> {
        self.inbox_tx
            .send(msg)
            .await
            .map_err(|_| BrokerError::Transport(format!("module '{}' inbox closed", self.name)))
    }

    pub async fn recv(&self) -> Option<Message> {
        self.outbox_rx.lock().await.recv().await
    }

    /// A sender aliasing this module's own inbox, handed to the event
    /// sequencer by `cmb.sub` so a matching EVENT lands in the same queue
    /// `main` already drains, rather than a separate subscription channel.
    pub fn inbox_sender(&self) -> mpsc::Sender<Message> {
        self.inbox_tx.clone()
    }

    /// Ask the module to finalize by dropping its inbox sender, then wait
    /// for it to reach `Exited`, returning its exit code. This is how
    /// `rmmod` (§4.13) drives a module to completion; invariant #3 requires
    /// the caller to have already torn down the module's registered
    /// services before (or atomically with) observing `Exited` here.
    pub async fn finalize_and_join(&self) -> Result<i32, BrokerError> {
        drop(self.inbox_tx.clone());
        let handle = self.join_handle.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| BrokerError::ModuleLoadFailed(self.name.clone(), e.is_panic() as i32)),
            None => Err(BrokerError::NotFound(format!(
                "module '{}' already joined",
                self.name
            ))),
        }
    }

    /// Wait for `insmod`'s deferred response: either the module reached
    /// `Running`, or it exited before ever getting there. Deliberately not
    /// phrased as "wait until state >= Running" — `Exited` is numerically
    /// past `Running` but skipping straight to it from `Init` is exactly
    /// the failure case `insmod` must distinguish and report.
    pub async fn wait_for_running_or_exit(&self) -> ModuleOutcome {
        loop {
            let notified = self.transition.notified();
            if self.reached_running.load(Ordering::SeqCst) {
                return ModuleOutcome::Running;
            }
            if self.state.get() == ModuleState::Exited {
                return ModuleOutcome::Exited(self.exit_code.load(Ordering::SeqCst));
            }
            notified.await;
        }
    }

    /// Wait until the module reaches at least `target`, for a deferred
    /// `rmmod` response (§4.8). If the module is already there or past it,
    /// resolves immediately.
    pub async fn wait_for(&self, target: ModuleState) {
        if self.state.get() as u8 >= target as u8 {
            return;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.state.waiters.lock().await;
            waiters.push(Waiter { target, reply: tx });
        }
        // Re-check after registering in case the transition raced ahead of
        // us between the early-return check and taking the lock.
        if self.state.get() as u8 >= target as u8 {
            return;
        }
        let _ = rx.await;
    }
}

impl StateCell {
    /// Drain waiters whose target has been met and wake them. Split from
    /// `advance_to` because a oneshot send must happen outside the filter
    /// closure (it consumes the sender).
    async fn wake_ready(&self, reached: ModuleState) {
        let mut waiters = self.waiters.lock().await;
        let mut i = 0;
        while i < waiters.len() {
            if waiters[i].target as u8 <= reached as u8 {
                let w = waiters.remove(i);
                let _ = w.reply.send(());
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ModuleMain for Echo {
        async fn main(&self, mut inbox: mpsc::Receiver<Message>, outbox: mpsc::Sender<Message>, ready: oneshot::Sender<()>) -> i32 {
            let _ = ready.send(());
            while let Some(msg) = inbox.recv().await {
                if outbox.send(msg).await.is_err() {
                    break;
                }
            }
            0
        }
    }

    /// A module whose `main` fails before it ever signals `ready`.
    struct InitFails(i32);

    #[async_trait]
    impl ModuleMain for InitFails {
        async fn main(&self, _inbox: mpsc::Receiver<Message>, _outbox: mpsc::Sender<Message>, _ready: oneshot::Sender<()>) -> i32 {
            self.0
        }
    }

    #[tokio::test]
    async fn module_reaches_running_then_echoes() {
        let handle = ModuleHandle::spawn(1, "echo", Arc::new(Echo));
        handle.wait_for_running_or_exit().await;

        let msg = Message::request("x.y", 0, 1, &()).unwrap();
        handle.send(msg.clone()).await.unwrap();
        let got = handle.recv().await.unwrap();
        assert_eq!(got.topic, "x.y");
    }

    #[tokio::test]
    async fn finalize_and_join_reaches_exited_and_returns_exit_code() {
        let handle = ModuleHandle::spawn(2, "echo", Arc::new(Echo));
        let code = handle.finalize_and_join().await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(handle.state(), ModuleState::Exited);
    }

    #[tokio::test]
    async fn wait_for_running_resolves_once_module_starts() {
        let handle = ModuleHandle::spawn(3, "echo", Arc::new(Echo));
        handle.wait_for(ModuleState::Running).await;
        assert!(handle.state() as u8 >= ModuleState::Running as u8);
    }

    #[tokio::test]
    async fn wait_for_running_or_exit_reports_running_on_success() {
        let handle = ModuleHandle::spawn(5, "echo", Arc::new(Echo));
        assert!(matches!(handle.wait_for_running_or_exit().await, ModuleOutcome::Running));
    }

    #[tokio::test]
    async fn wait_for_running_or_exit_reports_exited_when_init_fails() {
        let handle = ModuleHandle::spawn(6, "broken", Arc::new(InitFails(-1)));
        let outcome = handle.wait_for_running_or_exit().await;
        assert!(matches!(outcome, ModuleOutcome::Exited(-1)));
        // The module never passed through Running at all.
        assert!(!handle.reached_running.load(Ordering::SeqCst));
        assert_eq!(handle.state(), ModuleState::Exited);
    }

    #[tokio::test]
    async fn wait_for_exited_resolves_after_finalize() {
        let handle = ModuleHandle::spawn(4, "echo", Arc::new(Echo));
        drop(handle.inbox_tx.clone());
        handle.wait_for(ModuleState::Exited).await;
        assert_eq!(handle.state(), ModuleState::Exited);
    }
}
