//! Tenant context broadcaster
//!
//! Every process sharing a record file runs one broadcaster. `commit` is the
//! only writer. Other processes notice the write through a file watcher,
//! adopt the new context and, after a short delay, bump an invalidation epoch
//! that data fetchers watch to re-issue their queries. The committing process
//! tells its own listeners directly and never invalidates itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchboard_core::config::TenantConfig;
use switchboard_core::{Error, Result, TenantContext};

use crate::store::{ContextStore, StoredRecord};

const CHANGE_CAPACITY: usize = 64;

/// Where a context change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// `commit` in this process
    Local,
    /// Another process's commit, observed through the record file
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextChange {
    pub origin: ChangeOrigin,
    pub context: TenantContext,
    pub version: u64,
}

/// Outcome of [`TenantBroadcaster::commit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub version: u64,
    /// False when the record could not be written; local state still changed
    pub persisted: bool,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    context: TenantContext,
    /// Version of the last local commit, written or not
    version: u64,
    /// Last version known to be in the record, by writing or reading it
    synced: u64,
}

struct PendingInvalidation {
    id: u64,
    cancel: CancellationToken,
}

struct Inner {
    store: ContextStore,
    reload_delay: Duration,
    snapshot: Mutex<Snapshot>,
    context_tx: watch::Sender<TenantContext>,
    changes_tx: broadcast::Sender<ContextChange>,
    epoch_tx: watch::Sender<u64>,
    pending: Mutex<Option<PendingInvalidation>>,
    pending_ids: AtomicU64,
    watcher: Mutex<Option<RecommendedWatcher>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps this process's tenant context in step with the shared record
#[derive(Clone)]
pub struct TenantBroadcaster {
    inner: Arc<Inner>,
}

impl TenantBroadcaster {
    pub fn from_config(config: &TenantConfig) -> Self {
        Self::open(ContextStore::new(&config.store_path), config.reload_delay())
    }

    /// Start from whatever the record currently holds
    pub fn open(store: ContextStore, reload_delay: Duration) -> Self {
        let snapshot = match store.load() {
            Ok(Some(record)) => Snapshot {
                context: record.context(),
                version: record.version,
                synced: record.version,
            },
            Ok(None) => Snapshot::default(),
            Err(e) => {
                warn!("Starting with an empty tenant context: {}", e);
                Snapshot::default()
            }
        };
        debug!(
            "Tenant context {} (v{}) from {:?}",
            snapshot.context,
            snapshot.version,
            store.path()
        );

        let (context_tx, _) = watch::channel(snapshot.context.clone());
        let (changes_tx, _) = broadcast::channel(CHANGE_CAPACITY);
        let (epoch_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                store,
                reload_delay,
                snapshot: Mutex::new(snapshot),
                context_tx,
                changes_tx,
                epoch_tx,
                pending: Mutex::new(None),
                pending_ids: AtomicU64::new(0),
                watcher: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store_path(&self) -> &Path {
        self.inner.store.path()
    }

    pub fn context(&self) -> TenantContext {
        lock(&self.inner.snapshot).context.clone()
    }

    pub fn version(&self) -> u64 {
        lock(&self.inner.snapshot).version
    }

    pub fn watch_context(&self) -> watch::Receiver<TenantContext> {
        self.inner.context_tx.subscribe()
    }

    /// Local and remote context changes, in the order they were applied
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ContextChange> {
        self.inner.changes_tx.subscribe()
    }

    /// Invalidation epoch. It increases once per settled remote change;
    /// anything that fetched tenant-scoped data re-fetches when it moves.
    pub fn invalidations(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        *self.inner.epoch_tx.borrow()
    }

    /// Switch tenant. Local state changes even if the record cannot be
    /// written.
    pub fn commit(&self, context: TenantContext) -> Committed {
        // Never go backwards relative to what other processes wrote
        let stored_version = match self.inner.store.load() {
            Ok(record) => record.map(|r| r.version).unwrap_or(0),
            Err(e) => {
                warn!("Could not read current tenant record: {}", e);
                0
            }
        };

        let version = {
            let mut snapshot = lock(&self.inner.snapshot);
            snapshot.version = snapshot.version.max(stored_version) + 1;
            snapshot.context = context.clone();
            snapshot.version
        };
        self.inner.context_tx.send_replace(context.clone());

        let persisted = match self.inner.store.save(&StoredRecord::new(&context, version)) {
            Ok(()) => {
                let mut snapshot = lock(&self.inner.snapshot);
                snapshot.synced = snapshot.synced.max(version);
                true
            }
            Err(e) => {
                error!("Tenant context {} not persisted: {}", context, e);
                false
            }
        };

        info!("Committed tenant context {} (v{})", context, version);
        let _ = self.inner.changes_tx.send(ContextChange {
            origin: ChangeOrigin::Local,
            context,
            version,
        });
        Committed { version, persisted }
    }

    /// Re-read the record and adopt it if another process changed it.
    /// Called by the watcher on every file event.
    pub fn sync_from_store(&self) -> Option<ContextChange> {
        match self.inner.store.load() {
            Ok(Some(record)) => self.apply_record(&record),
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable tenant record: {}", e);
                None
            }
        }
    }

    /// Adopt a record written by someone else. Records older than the last
    /// one this process wrote or read are ignored, as are records matching
    /// the local context. Local commits that never reached the record do not
    /// count, so they lose to any later write from another process.
    pub fn apply_record(&self, record: &StoredRecord) -> Option<ContextChange> {
        let incoming = record.context();
        {
            let mut snapshot = lock(&self.inner.snapshot);
            if record.version < snapshot.synced {
                debug!(
                    "Ignoring stale tenant record v{} (synced to v{})",
                    record.version, snapshot.synced
                );
                return None;
            }
            snapshot.synced = record.version;
            if incoming == snapshot.context {
                snapshot.version = snapshot.version.max(record.version);
                return None;
            }
            snapshot.context = incoming.clone();
            snapshot.version = record.version;
        }

        info!(
            "Adopted tenant context {} (v{}) from another process",
            incoming, record.version
        );
        self.inner.context_tx.send_replace(incoming.clone());
        let change = ContextChange {
            origin: ChangeOrigin::Remote,
            context: incoming,
            version: record.version,
        };
        let _ = self.inner.changes_tx.send(change.clone());
        self.schedule_invalidation();
        Some(change)
    }

    /// Bump the epoch after the reload delay, superseding a pending bump
    fn schedule_invalidation(&self) {
        let id = self.inner.pending_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.inner.shutdown.child_token();
        let superseded = lock(&self.inner.pending).replace(PendingInvalidation {
            id,
            cancel: cancel.clone(),
        });
        if let Some(previous) = superseded {
            debug!("Superseding pending invalidation {}", previous.id);
            previous.cancel.cancel();
        }

        let inner = self.inner.clone();
        let delay = self.inner.reload_delay;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut pending = lock(&inner.pending);
                        if pending.as_ref().map(|p| p.id) == Some(id) {
                            pending.take();
                        }
                    }
                    inner.epoch_tx.send_modify(|epoch| *epoch += 1);
                    info!("Tenant context invalidated (epoch {})", *inner.epoch_tx.borrow());
                }
            }
        });
    }

    pub fn has_pending_invalidation(&self) -> bool {
        lock(&self.inner.pending).is_some()
    }

    /// Watch the record's directory and sync on every change to the record.
    /// Idempotent.
    pub fn start_watching(&self) -> Result<()> {
        let mut slot = lock(&self.inner.watcher);
        if slot.is_some() {
            return Ok(());
        }

        let path = self.inner.store.path().to_path_buf();
        let dir = watch_dir(&path);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Persistence(format!("failed to create {:?}: {}", dir, e)))?;
        let file_name = path.file_name().map(|n| n.to_os_string());

        let (event_tx, mut event_rx) = mpsc::channel::<()>(16);
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if relevant {
                        // A full queue already guarantees a re-read
                        let _ = event_tx.try_send(());
                    }
                }
                Err(err) => error!("Tenant record watcher error: {}", err),
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Persistence(format!("failed to start watcher: {}", e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Persistence(format!("failed to watch {:?}: {}", dir, e)))?;
        *slot = Some(watcher);
        drop(slot);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = event_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        let Some(inner) = weak.upgrade() else { break };
                        TenantBroadcaster { inner }.sync_from_store();
                    }
                }
            }
            debug!("Tenant record watcher stopped");
        });

        info!("Watching tenant record {:?}", path);
        Ok(())
    }

    /// Stop watching and cancel any pending invalidation
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        lock(&self.inner.pending).take();
        if lock(&self.inner.watcher).take().is_some() {
            info!("Stopped watching tenant record {:?}", self.inner.store.path());
        }
    }
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_millis(100);

    fn pair(dir: &TempDir) -> (TenantBroadcaster, TenantBroadcaster) {
        let path = dir.path().join("tenant-context.json");
        (
            TenantBroadcaster::open(ContextStore::new(&path), DELAY),
            TenantBroadcaster::open(ContextStore::new(&path), DELAY),
        )
    }

    #[tokio::test]
    async fn test_commit_notifies_same_process() {
        let dir = TempDir::new().unwrap();
        let (a, _) = pair(&dir);
        let mut changes = a.subscribe_changes();

        let committed = a.commit(TenantContext::new("cust-1", "proj-9"));
        assert_eq!(committed, Committed { version: 1, persisted: true });
        assert_eq!(a.context(), TenantContext::new("cust-1", "proj-9"));
        assert_eq!(*a.watch_context().borrow(), TenantContext::new("cust-1", "proj-9"));

        let change = changes.try_recv().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(change.version, 1);
        assert!(!a.has_pending_invalidation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_commit_adopted_and_invalidated() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        let mut a_epoch = a.invalidations();
        let mut b_epoch = b.invalidations();

        a.commit(TenantContext::new("cust-1", "proj-9"));
        assert!(a.sync_from_store().is_none());

        let started = Instant::now();
        let change = b.sync_from_store().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert_eq!(b.context(), TenantContext::new("cust-1", "proj-9"));
        assert_eq!(b.epoch(), 0);

        b_epoch.changed().await.unwrap();
        assert_eq!(*b_epoch.borrow(), 1);
        assert!(started.elapsed() >= DELAY);

        // The committer never invalidates itself
        assert!(
            tokio::time::timeout(Duration::from_secs(1), a_epoch.changed())
                .await
                .is_err()
        );
        assert_eq!(a.epoch(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_change_supersedes_pending_invalidation() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        let mut b_epoch = b.invalidations();

        let started = Instant::now();
        a.commit(TenantContext::new("cust-1", "proj-1"));
        b.sync_from_store().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.commit(TenantContext::new("cust-1", "proj-2"));
        b.sync_from_store().unwrap();

        b_epoch.changed().await.unwrap();
        assert_eq!(*b_epoch.borrow(), 1);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(b.context().project_id.as_deref(), Some("proj-2"));

        assert!(
            tokio::time::timeout(Duration::from_secs(1), b_epoch.changed())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_invalidation() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        a.commit(TenantContext::new("cust-1", "proj-9"));
        b.sync_from_store().unwrap();
        assert!(b.has_pending_invalidation());

        b.shutdown();
        assert!(!b.has_pending_invalidation());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(b.epoch(), 0);
    }

    #[tokio::test]
    async fn test_stale_record_ignored() {
        let dir = TempDir::new().unwrap();
        let (a, _) = pair(&dir);
        a.commit(TenantContext::new("cust-1", "proj-1"));
        a.commit(TenantContext::new("cust-1", "proj-2"));

        let stale = StoredRecord::new(&TenantContext::new("cust-1", "proj-1"), 1);
        assert!(a.apply_record(&stale).is_none());
        assert_eq!(a.context().project_id.as_deref(), Some("proj-2"));
    }

    #[tokio::test]
    async fn test_versions_continue_from_store() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        a.commit(TenantContext::new("cust-1", "proj-1"));
        a.commit(TenantContext::new("cust-1", "proj-2"));

        // b never synced, but still writes past a's version
        let committed = b.commit(TenantContext::new("cust-2", "proj-1"));
        assert_eq!(committed.version, 3);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_local_state() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file").unwrap();
        let broadcaster = TenantBroadcaster::open(ContextStore::new(blocker.join("ctx.json")), DELAY);
        let mut changes = broadcaster.subscribe_changes();

        let committed = broadcaster.commit(TenantContext::new("cust-1", "proj-9"));
        assert!(!committed.persisted);
        assert_eq!(broadcaster.context(), TenantContext::new("cust-1", "proj-9"));
        assert_eq!(changes.try_recv().unwrap().origin, ChangeOrigin::Local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritten_commits_lose_to_remote_switch() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        // A directory at the temp path makes every save fail
        let temp_path = b
            .store_path()
            .with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::create_dir(&temp_path).unwrap();

        assert!(!b.commit(TenantContext::new("local", "x")).persisted);
        let unwritten = b.commit(TenantContext::new("local", "y"));
        assert!(!unwritten.persisted);
        assert_eq!(unwritten.version, 2);

        std::fs::remove_dir(&temp_path).unwrap();
        let committed = a.commit(TenantContext::new("cust-1", "proj-9"));
        assert_eq!(committed, Committed { version: 1, persisted: true });

        let change = b.sync_from_store().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert_eq!(b.context(), TenantContext::new("cust-1", "proj-9"));
        assert_eq!(b.version(), 1);
        assert!(b.has_pending_invalidation());

        // Writing again continues from the adopted record
        let next = b.commit(TenantContext::new("cust-2", "proj-1"));
        assert_eq!(next, Committed { version: 2, persisted: true });
        assert!(a.sync_from_store().is_some());
        assert_eq!(a.context(), TenantContext::new("cust-2", "proj-1"));
    }

    #[tokio::test]
    async fn test_open_reads_existing_record() {
        let dir = TempDir::new().unwrap();
        let (a, _) = pair(&dir);
        a.commit(TenantContext::new("cust-7", "proj-3"));

        let reopened = TenantBroadcaster::open(ContextStore::new(a.store_path()), DELAY);
        assert_eq!(reopened.context(), TenantContext::new("cust-7", "proj-3"));
        assert_eq!(reopened.version(), 1);
    }

    #[tokio::test]
    async fn test_watcher_observes_other_process() {
        let dir = TempDir::new().unwrap();
        let (a, b) = pair(&dir);
        b.start_watching().unwrap();
        b.start_watching().unwrap();
        let mut changes = b.subscribe_changes();

        a.commit(TenantContext::new("cust-1", "proj-9"));

        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("watcher did not report the change")
            .unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert_eq!(change.context, TenantContext::new("cust-1", "proj-9"));
        b.shutdown();
    }
}
