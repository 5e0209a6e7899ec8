//! Command router: handler registry plus a pending queue
//!
//! Every inbound command is queued first. A command leaves the queue only
//! when a handler for its action exists, so a command that arrives before its
//! consumer registers waits instead of being lost: registering a handler
//! re-scans the queue and dispatches whatever has become routable.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchboard_core::{Command, Error, Result};

use crate::protocol::RoomEnvelope;
use crate::transport::TransportChannel;

/// Fulfils one command action
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> Result<()>;
}

/// Adapter turning a synchronous closure into a [`CommandHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&Command) -> Result<()> + Send + Sync,
{
    async fn handle(&self, command: &Command) -> Result<()> {
        (self.0)(command)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(&Command) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Default)]
struct RouterState {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    pending: VecDeque<Command>,
}

#[derive(Default)]
struct RouterInner {
    state: Mutex<RouterState>,
    /// Held by whichever task is currently draining the queue
    drain_gate: tokio::sync::Mutex<()>,
    /// Set whenever the queue or the registry changed since the last scan
    rescan: AtomicBool,
    dispatched: AtomicU64,
    last_error: Mutex<Option<Error>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes commands to registered handlers. Clones share one registry.
#[derive(Clone, Default)]
pub struct CommandRouter {
    inner: Arc<RouterInner>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for an action, then dispatch any
    /// queued commands it makes routable.
    pub async fn register_handler(&self, action: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        let action = action.into();
        {
            let mut state = lock(&self.inner.state);
            if state.handlers.insert(action.clone(), handler).is_some() {
                debug!("Replaced handler for '{}'", action);
            } else {
                debug!("Registered handler for '{}'", action);
            }
        }
        self.drain().await;
    }

    /// Remove the handler for an action. Later commands for it are queued.
    pub fn unregister_handler(&self, action: &str) -> bool {
        let removed = lock(&self.inner.state).handlers.remove(action).is_some();
        if removed {
            debug!("Unregistered handler for '{}'", action);
        }
        removed
    }

    pub fn has_handler(&self, action: &str) -> bool {
        lock(&self.inner.state).handlers.contains_key(action)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = lock(&self.inner.state).handlers.keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Commands still waiting for a handler, oldest first
    pub fn pending(&self) -> Vec<Command> {
        lock(&self.inner.state).pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Total commands handed to a handler so far
    pub fn dispatched_count(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Most recent handler failure
    pub fn last_error(&self) -> Option<Error> {
        lock(&self.inner.last_error).clone()
    }

    /// Accept an inbound command: queue it, then dispatch everything routable
    pub async fn dispatch(&self, command: Command) {
        {
            let mut state = lock(&self.inner.state);
            if !state.handlers.contains_key(&command.action) {
                info!(
                    "No handler for '{}' yet, queued ({} pending)",
                    command.action,
                    state.pending.len() + 1
                );
            }
            state.pending.push_back(command);
        }
        self.drain().await;
    }

    /// Dispatch every queued command that has a handler, in arrival order.
    ///
    /// Only one task drains at a time. A caller that finds the gate taken
    /// leaves its rescan request behind for the active drainer.
    async fn drain(&self) {
        self.inner.rescan.store(true, Ordering::SeqCst);
        loop {
            let Ok(gate) = self.inner.drain_gate.try_lock() else {
                return;
            };
            while self.inner.rescan.swap(false, Ordering::SeqCst) {
                let batch = self.take_routable();
                for (command, handler) in batch {
                    self.invoke(command, handler).await;
                }
            }
            drop(gate);
            if !self.inner.rescan.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Pull routable commands out of the queue, keeping the rest in order
    fn take_routable(&self) -> Vec<(Command, Arc<dyn CommandHandler>)> {
        let mut state = lock(&self.inner.state);
        let RouterState { handlers, pending } = &mut *state;
        let mut routable = Vec::new();
        let mut waiting = VecDeque::with_capacity(pending.len());
        for command in pending.drain(..) {
            match handlers.get(&command.action) {
                Some(handler) => routable.push((command, handler.clone())),
                None => waiting.push_back(command),
            }
        }
        *pending = waiting;
        routable
    }

    async fn invoke(&self, command: Command, handler: Arc<dyn CommandHandler>) {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        let outcome = AssertUnwindSafe(handler.handle(&command)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => {
                debug!("Dispatched '{}'", command.action);
                return;
            }
            Ok(Err(e)) => e,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!("Handler for '{}' panicked: {}", command.action, message);
                Error::handler(&command.action, message)
            }
        };
        let failure = match failure {
            Error::Handler { .. } => failure,
            other => Error::handler(&command.action, other),
        };
        warn!("{}", failure);
        *lock(&self.inner.last_error) = Some(failure);
    }

    /// Feed every `tool_command` arriving on a channel into this router
    pub fn attach(&self, channel: &TransportChannel) -> RouterAttachment {
        let mut inbound = channel.subscribe();
        let router = self.clone();
        let room = channel.room_id().to_string();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = inbound.recv() => match received {
                        Ok(RoomEnvelope::ToolCommand(command)) => router.dispatch(command).await,
                        Ok(other) => debug!("Router ignoring {} on room '{}'", other.kind(), room),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Router lagged on room '{}', {} envelope(s) lost", room, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Router detached from room '{}'", room);
        });

        RouterAttachment { cancel, task }
    }
}

/// A running channel → router feed. Dropping it detaches.
pub struct RouterAttachment {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RouterAttachment {
    /// Stop feeding the router
    pub fn detach(self) {
        // Drop does the work
    }

    pub fn is_attached(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RouterAttachment {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}
