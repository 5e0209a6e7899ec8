//! Progress stream client: one resilient stream per task
//!
//! Each open stream is a task that connects through a [`ProgressSource`],
//! forwards progress, and reconnects on failure following a
//! [`ReconnectPolicy`]. A stream ends exactly once: with a completion, a
//! failure, or an explicit close. The reconnect timer is a `select!` against
//! the stream's cancellation token, so closing never leaves a timer behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use switchboard_core::{ConnectionState, Error, ProgressStreamData, ProgressSummary};

use crate::backoff::ReconnectPolicy;
use crate::frame::ProgressFrame;
use crate::source::ProgressSource;

/// What a [`ProgressStream`] yields
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Progress(ProgressStreamData),
    /// Terminal: the task finished
    Completed(ProgressSummary),
    /// Terminal: the server reported an error or reconnects ran out
    Failed(Error),
}

impl StreamItem {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamItem::Progress(_))
    }
}

/// Consumer handle of one task's stream. Dropping it closes the stream.
pub struct ProgressStream {
    task_id: String,
    items: mpsc::UnboundedReceiver<StreamItem>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl ProgressStream {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next item; `None` once the stream has ended or was closed
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.items.recv().await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop streaming. Cancels any pending reconnect.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ActiveStream {
    generation: u64,
    cancel: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<String, ActiveStream>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Opens and tracks progress streams, at most one per task id
#[derive(Clone)]
pub struct ProgressStreamClient {
    source: Arc<dyn ProgressSource>,
    policy: ReconnectPolicy,
    streams: Registry,
    generation: Arc<AtomicU64>,
}

impl ProgressStreamClient {
    pub fn new(source: Arc<dyn ProgressSource>, policy: ReconnectPolicy) -> Self {
        Self {
            source,
            policy,
            streams: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Start streaming a task. An already-open stream for the same task is
    /// closed first.
    pub fn open(&self, task_id: impl Into<String>) -> ProgressStream {
        let task_id = task_id.into();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        let previous = lock(&self.streams).insert(
            task_id.clone(),
            ActiveStream {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            info!("Replacing open progress stream for task {}", task_id);
            previous.cancel.cancel();
        }

        let (items_tx, items) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);

        let run = StreamRun {
            source: self.source.clone(),
            policy: self.policy,
            task_id: task_id.clone(),
            items: items_tx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        let streams = self.streams.clone();
        tokio::spawn(async move {
            let task_id = run.task_id.clone();
            run.run().await;
            let mut streams = lock(&streams);
            if streams.get(&task_id).map(|s| s.generation) == Some(generation) {
                streams.remove(&task_id);
            }
        });

        ProgressStream {
            task_id,
            items,
            state,
            cancel,
        }
    }

    /// Close a task's stream. Returns whether one was open.
    pub fn close(&self, task_id: &str) -> bool {
        match lock(&self.streams).remove(task_id) {
            Some(active) => {
                active.cancel.cancel();
                debug!("Closed progress stream for task {}", task_id);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        for (_, active) in lock(&self.streams).drain() {
            active.cancel.cancel();
        }
    }

    pub fn is_open(&self, task_id: &str) -> bool {
        lock(&self.streams).contains_key(task_id)
    }

    /// Task ids with a live stream, sorted
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.streams).keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// How one connection attempt ended
enum Attempt {
    Terminal(StreamItem),
    Failed(Error),
    Cancelled,
}

struct StreamRun {
    source: Arc<dyn ProgressSource>,
    policy: ReconnectPolicy,
    task_id: String,
    items: mpsc::UnboundedSender<StreamItem>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl StreamRun {
    async fn run(self) {
        let mut failures: u32 = 0;
        let mut last_summary = ProgressSummary {
            task_id: self.task_id.clone(),
            ..Default::default()
        };

        let terminal = loop {
            let attempt = self.attempt(&mut failures, &mut last_summary).await;
            let err = match attempt {
                Attempt::Terminal(item) => break Some(item),
                Attempt::Cancelled => break None,
                Attempt::Failed(err) => err,
            };

            failures += 1;
            let Some(delay) = self.policy.after_failures(failures) else {
                error!(
                    "Progress stream for task {} gave up after {} reconnect attempts: {}",
                    self.task_id, self.policy.max_attempts, err
                );
                break Some(StreamItem::Failed(Error::ReconnectExhausted {
                    attempts: self.policy.max_attempts,
                    last_error: err.to_string(),
                }));
            };

            warn!(
                "Progress stream for task {} failed (attempt {}): {}; retrying in {:?}",
                self.task_id, failures, err, delay
            );
            self.state.send_replace(ConnectionState::Reconnecting);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        match terminal {
            Some(item) => {
                let state = match &item {
                    StreamItem::Failed(_) => ConnectionState::Failed,
                    _ => ConnectionState::Disconnected,
                };
                self.state.send_replace(state);
                // A consumer that already dropped its handle does not need it
                let _ = self.items.send(item);
            }
            None => {
                self.state.send_replace(ConnectionState::Disconnected);
                debug!("Progress stream for task {} closed", self.task_id);
            }
        }
    }

    async fn attempt(&self, failures: &mut u32, last_summary: &mut ProgressSummary) -> Attempt {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Attempt::Cancelled,
            opened = self.source.open(&self.task_id) => opened,
        };
        let mut frames = match opened {
            Ok(frames) => frames,
            Err(e) => return Attempt::Failed(e),
        };

        *failures = 0;
        self.state.send_replace(ConnectionState::Connected);
        info!("Progress stream for task {} connected", self.task_id);

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Attempt::Cancelled,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(ProgressFrame::Update(data))) => {
                    let data = data.normalized();
                    if data.heartbeat {
                        trace!("Heartbeat on task {}", self.task_id);
                        continue;
                    }
                    *last_summary = data.summary.clone();
                    let complete = data.summary.is_complete();
                    if self.items.send(StreamItem::Progress(data)).is_err() {
                        return Attempt::Cancelled;
                    }
                    if complete {
                        info!("Task {} reached 100%", self.task_id);
                        return Attempt::Terminal(StreamItem::Completed(last_summary.clone()));
                    }
                }
                Some(Ok(ProgressFrame::Complete(summary))) => {
                    info!("Task {} completed", self.task_id);
                    let summary = summary.unwrap_or_else(|| last_summary.clone());
                    return Attempt::Terminal(StreamItem::Completed(summary));
                }
                Some(Ok(ProgressFrame::Error(message))) => {
                    error!("Task {} reported an error: {}", self.task_id, message);
                    return Attempt::Terminal(StreamItem::Failed(Error::Connection(format!(
                        "task reported error: {}",
                        message
                    ))));
                }
                Some(Err(Error::Parse(e))) => {
                    warn!("Skipping malformed progress frame for task {}: {}", self.task_id, e);
                }
                Some(Err(e)) => return Attempt::Failed(e),
                None => {
                    return Attempt::Failed(Error::Connection(
                        "progress stream ended before completion".to_string(),
                    ));
                }
            }
        }
    }
}
