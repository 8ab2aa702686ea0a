//! The sync engine: drains the ledger's change feed exactly once per entry
//! and applies each change to whichever side has not yet seen it.
//!
//! The per-side revision counters decide who is behind; the ledger's single
//! global lock guarantees at most one batch of changes is being applied at a
//! time. Failures are classified: quota and permission problems are fatal,
//! connectivity loss parks the loop until the remote answers again, and
//! everything else consumes the document's retry budget so one poisoned
//! document can never block the rest of the tree.

use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent};
use crate::ignore::Ignore;
use crate::ledger::{Change, Ledger, LedgerError};
use crate::metadata::{DocType, Metadata, RemoteRef, SideName, is_up_to_date, mark_side, parent_id, same_file_ignore_rev};
use crate::side::{Side, SideError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Which direction(s) to synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only changes from the remote store are applied to the filesystem.
    Pull,
    /// Only changes from the filesystem are applied to the remote store.
    Push,
    /// Full synchronization of both sides.
    Full,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no space left on the local disk")]
    NoDiskSpace,

    #[error("remote storage quota exceeded")]
    RemoteQuotaExceeded,

    #[error("remote client has been revoked")]
    ClientRevoked,

    #[error("remote client lacks a required permission")]
    MissingPermission,

    /// Halting condition the caller must render to the user (billing or plan
    /// issues); carries the structured details the remote returned.
    #[error("user action required: {message}")]
    UserActionRequired {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Side(#[from] SideError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// A remote report of a file whose stored content failed verification.
#[derive(Debug, Clone)]
pub struct FileCorruption {
    pub remote_id: String,
    pub rev: u64,
    pub path: String,
    pub checksum: String,
}

/// Source of corruption reports, implemented by the remote adapter.
#[async_trait]
pub trait CorruptionSource: Send + Sync {
    async fn fetch_file_corruptions(&self) -> crate::side::Result<Vec<FileCorruption>>;
}

/// Replays ledger changes onto the lagging side.
pub struct SyncEngine {
    ledger: Arc<Ledger>,
    local: Arc<dyn Side>,
    remote: Arc<dyn Side>,
    ignore: Ignore,
    events: Arc<EventBus>,
    config: SyncConfig,
    corruptions: Option<Arc<dyn CorruptionSource>>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl SyncEngine {
    /// Wire the engine and hand each side a capability handle to the other
    /// for content transfer.
    pub fn new(
        ledger: Arc<Ledger>,
        local: Arc<dyn Side>,
        remote: Arc<dyn Side>,
        ignore: Ignore,
        events: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        local.connect_source(Arc::clone(&remote));
        remote.connect_source(Arc::clone(&local));
        SyncEngine {
            ledger,
            local,
            remote,
            ignore,
            events,
            config,
            corruptions: None,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn with_corruption_source(mut self, source: Arc<dyn CorruptionSource>) -> Self {
        self.corruptions = Some(source);
        self
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    fn side(&self, name: SideName) -> &Arc<dyn Side> {
        match name {
            SideName::Local => &self.local,
            SideName::Remote => &self.remote,
        }
    }

    /// Run the loop until stopped or a fatal error. The caller starts the
    /// side watchers that match `mode`; the engine replays whatever reaches
    /// the ledger either way.
    pub async fn start(&self, mode: SyncMode) -> Result<()> {
        info!(?mode, "starting synchronization");
        self.stopped.store(false, Ordering::SeqCst);
        if let Err(err) = self.fix_corrupt_files().await {
            warn!(%err, "could not handle corruption reports");
        }
        while !self.is_stopped() {
            self.sync_once(true).await?;
        }
        Ok(())
    }

    /// Request a cooperative stop: the current change finishes, the batch
    /// ends, any wait is cancelled.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// One wait-lock-drain cycle.
    pub async fn sync_once(&self, wait_for_changes: bool) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }
        let seq = self.ledger.get_local_seq().await;
        trace!(seq, "waiting for changes");
        if wait_for_changes {
            tokio::select! {
                _ = self.ledger.wait_for_change(seq) => {}
                _ = self.stop_notify.notified() => return Ok(()),
            }
        }
        self.events.emit(SyncEvent::SyncStart);
        let guard = self.ledger.lock().await;
        let result = self.sync_batch().await;
        drop(guard);
        self.events.emit(SyncEvent::SyncEnd);
        result
    }

    async fn sync_batch(&self) -> Result<()> {
        loop {
            if self.is_stopped() {
                break;
            }
            let seq = self.ledger.get_local_seq().await;
            let Some(change) = self.ledger.next_change(seq).await else {
                break;
            };
            self.events.emit(SyncEvent::SyncCurrent { seq: change.seq });
            if change.doc.errors >= self.config.max_sync_attempts {
                warn!(
                    path = %change.doc.path,
                    errors = change.doc.errors,
                    "error budget exhausted, abandoning this change"
                );
                self.ledger.set_local_seq(change.seq).await;
                continue;
            }
            if let Err(err) = self.apply(change).await {
                if self.is_stopped() {
                    break;
                }
                return Err(err);
            }
        }
        debug!("no more metadata changes for now");
        Ok(())
    }

    /// Apply one change to the side that has not seen it yet.
    async fn apply(&self, change: Change) -> Result<()> {
        let doc = change.doc.clone();
        debug!(path = %doc.path, seq = change.seq, "applying change");

        if self.ignore.is_ignored(&doc) {
            self.ledger.set_local_seq(change.seq).await;
            return Ok(());
        }
        let Some((side_name, rev)) = select_side(&doc) else {
            info!(path = %doc.path, "up to date");
            self.ledger.set_local_seq(change.seq).await;
            return Ok(());
        };
        match self.apply_to_side(&change, side_name, rev).await {
            Ok(()) => Ok(()),
            Err(err) => self.handle_apply_error(&change, side_name, err).await,
        }
    }

    async fn apply_to_side(&self, change: &Change, side_name: SideName, rev: u64) -> Result<()> {
        let mut doc = change.doc.clone();
        let side = Arc::clone(self.side(side_name));
        if side_name == SideName::Remote && doc.trashed {
            // The entry was just deleted locally; prefer trashing a whole
            // pending-trash ancestor remotely over each descendant.
            let by_itself = self.trash_with_parent_or_by_itself(&doc, &side).await?;
            if !by_itself {
                // An ancestor covers this document; its own turn comes back
                // around once the cascade has settled.
                return Ok(());
            }
        } else {
            self.apply_doc(&mut doc, &side, side_name, rev).await?;
            doc.move_from = None;
            doc.overwrite = None;
        }
        trace!(path = %doc.path, seq = change.seq, "applied change on the {} side", side_name);
        self.ledger.set_local_seq(change.seq).await;
        if !change.doc.deleted {
            self.update_revs(doc, side_name).await?;
        }
        Ok(())
    }

    async fn apply_doc(
        &self,
        doc: &mut Metadata,
        side: &Arc<dyn Side>,
        side_name: SideName,
        rev: u64,
    ) -> Result<()> {
        if !doc.incompatibilities.is_empty()
            && side_name == SideName::Local
            && doc.move_to.is_none()
        {
            match doc.move_from.clone() {
                Some(was) if was.incompatibilities.is_empty() => {
                    if !was.child_move {
                        // Move compatible -> incompatible: drop the old local
                        // entry instead of writing an unsupported name.
                        warn!(
                            path = %doc.path,
                            oldpath = %was.path,
                            "trashing the local entry, its new name cannot be written here"
                        );
                        side.trash(&was).await?;
                        self.events.emit(SyncEvent::DeleteFile {
                            path: was.path.clone(),
                        });
                    } else {
                        debug!(path = %doc.path, "incompatible entry was trashed with its parent");
                    }
                }
                _ => {
                    warn!(path = %doc.path, "not syncing, the name cannot be written here");
                }
            }
        } else if doc.deleted && rev == 0 {
            // Deletion of something this side has never seen.
        } else if doc.move_to.is_some() {
            debug!(path = %doc.path, "move source, the destination document carries the action");
        } else if let Some(from) = doc.move_from.clone() {
            if !from.incompatibilities.is_empty() {
                self.do_add(side, doc).await?;
            } else if from.child_move {
                side.assign_new_rev(doc).await?;
                self.events.emit(SyncEvent::TransferMove {
                    path: doc.path.clone(),
                    old_path: from.path.clone(),
                });
            } else {
                self.do_move(side, doc, &from).await?;
            }
        } else if doc.deleted {
            match doc.doc_type {
                DocType::File => {
                    side.trash(doc).await?;
                    self.events.emit(SyncEvent::DeleteFile {
                        path: doc.path.clone(),
                    });
                }
                DocType::Folder => side.delete_folder(doc).await?,
            }
        } else if rev == 0 {
            self.do_add(side, doc).await?;
        } else {
            match self.ledger.get_previous_rev(&doc.id, rev).await {
                Err(_) => {
                    // History is gone; a full overwrite is the safe fallback.
                    self.do_overwrite(side, doc).await?;
                }
                Ok(old) => {
                    if doc.doc_type == DocType::Folder {
                        side.update_folder(doc, &old).await?;
                    } else if old.checksum == doc.checksum {
                        if same_file_ignore_rev(&old, doc) {
                            debug!(path = %doc.path, "ignoring timestamp-only change");
                        } else {
                            side.update_file_metadata(doc, &old).await?;
                        }
                    } else {
                        side.overwrite_file(doc, Some(&old)).await?;
                        self.events.emit(SyncEvent::TransferStarted {
                            path: doc.path.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn do_add(&self, side: &Arc<dyn Side>, doc: &mut Metadata) -> Result<()> {
        match doc.doc_type {
            DocType::File => {
                side.add_file(doc).await?;
                self.events.emit(SyncEvent::TransferStarted {
                    path: doc.path.clone(),
                });
            }
            DocType::Folder => side.add_folder(doc).await?,
        }
        Ok(())
    }

    async fn do_overwrite(&self, side: &Arc<dyn Side>, doc: &mut Metadata) -> Result<()> {
        match doc.doc_type {
            DocType::File => {
                side.overwrite_file(doc, None).await?;
                self.events.emit(SyncEvent::TransferStarted {
                    path: doc.path.clone(),
                });
            }
            DocType::Folder => side.add_folder(doc).await?,
        }
        Ok(())
    }

    async fn do_move(&self, side: &Arc<dyn Side>, doc: &mut Metadata, old: &Metadata) -> Result<()> {
        if let Some(overwritten) = doc.overwrite.clone() {
            self.trash_with_parent_or_by_itself(&overwritten, side).await?;
        }
        match doc.doc_type {
            DocType::File => {
                side.move_file(doc, old).await?;
                self.events.emit(SyncEvent::TransferMove {
                    path: doc.path.clone(),
                    old_path: old.path.clone(),
                });
            }
            DocType::Folder => side.move_folder(doc, old).await?,
        }
        Ok(())
    }

    /// Prefer trashing a pending-trash ancestor as a single operation over
    /// trashing each descendant individually, to preserve the tree in the
    /// trash. Returns whether this document still needs its own trash call.
    pub async fn trash_with_parent_or_by_itself(
        &self,
        doc: &Metadata,
        side: &Arc<dyn Side>,
    ) -> Result<bool> {
        if let Some(pid) = parent_id(&doc.id) {
            if let Some(parent) = self.ledger.get_maybe(pid).await {
                let parent = if parent.trashed {
                    parent
                } else {
                    // Give a concurrently-trashing parent a moment to reach
                    // the ledger.
                    sleep(self.config.trash_parent_delay).await;
                    self.ledger.get_maybe(pid).await.unwrap_or(parent)
                };
                if parent.trashed && !is_up_to_date(side.name(), &parent) {
                    info!(path = %doc.path, "will be trashed with its parent directory");
                    Box::pin(self.trash_with_parent_or_by_itself(&parent, side)).await?;
                    // Wait long enough for the cascade to reach the feed.
                    sleep(self.config.trash_settle_delay).await;
                    return Ok(false);
                }
            }
        }
        info!(path = %doc.path, "trashed by itself");
        side.trash(doc).await?;
        self.events.emit(SyncEvent::DeleteFile {
            path: doc.path.clone(),
        });
        Ok(true)
    }

    /// Bump both sides' counters past the stored revision so the document
    /// reads as in sync, and clear its error budget.
    async fn update_revs(&self, mut doc: Metadata, side_name: SideName) -> Result<()> {
        let rev = doc.rev + 1;
        doc.sides.set(SideName::Local, rev);
        doc.sides.set(SideName::Remote, rev);
        doc.errors = 0;
        match self.ledger.put(doc.clone()).await {
            Ok(_) => Ok(()),
            Err(LedgerError::Conflict(_)) => {
                // A concurrent write landed first (e.g. the watcher saw our
                // own replay); re-apply just this side's bump on the fresh
                // document.
                let mut current = self.ledger.get(&doc.id).await?;
                current.sides.set(side_name, rev);
                self.ledger.put(current).await?;
                Ok(())
            }
            Err(err) => {
                warn!(path = %doc.path, %err, "race while updating revision counters");
                Ok(())
            }
        }
    }

    /// Make the error explicit (offline, disk full, quota exceeded, …) and
    /// keep track of the number of retries.
    async fn handle_apply_error(
        &self,
        change: &Change,
        side_name: SideName,
        err: SyncError,
    ) -> Result<()> {
        error!(path = %change.doc.path, %err, "failed to apply change");
        match &err {
            SyncError::Side(SideError::NoSpaceLeft) => return Err(SyncError::NoDiskSpace),
            SyncError::Side(SideError::Remote { status: 413, .. }) => {
                return Err(SyncError::RemoteQuotaExceeded);
            }
            _ => {}
        }
        match self.remote.probe().await {
            Ok(()) => self.update_errors(change, side_name).await,
            Err(SideError::Remote { status: 400, .. }) => {
                error!("remote client has been revoked");
                Err(SyncError::ClientRevoked)
            }
            Err(SideError::Remote {
                status: 402,
                message,
                details,
            }) => {
                error!("user action required");
                Err(SyncError::UserActionRequired { message, details })
            }
            Err(SideError::Remote { status: 403, .. }) => {
                error!("remote client lacks a required permission");
                Err(SyncError::MissingPermission)
            }
            Err(probe_err) => {
                // The remote is unreachable; park until it answers again.
                // Connectivity loss does not count against the error budget.
                warn!(%probe_err, "remote unreachable, going offline");
                self.events.emit(SyncEvent::Offline);
                loop {
                    tokio::select! {
                        _ = sleep(self.config.offline_poll_interval) => {}
                        _ = self.stop_notify.notified() => return Ok(()),
                    }
                    if self.remote.probe().await.is_ok() {
                        info!("back online");
                        self.events.emit(SyncEvent::Online);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Count one failed attempt against the document's budget. At the budget
    /// the change is loudly abandoned; the batch loop advances past it on the
    /// next encounter.
    async fn update_errors(&self, change: &Change, side_name: SideName) -> Result<()> {
        let mut doc = change.doc.clone();
        doc.errors += 1;
        // The source side still owns the pending change after this
        // bookkeeping write.
        let prev = doc.clone();
        mark_side(side_name.other(), &mut doc, Some(&prev));
        if doc.errors >= self.config.max_sync_attempts {
            error!(
                path = %doc.path,
                attempts = doc.errors,
                "failed to sync after {} attempts, giving up",
                self.config.max_sync_attempts
            );
        }
        match self.ledger.put(doc).await {
            Ok(_) => Ok(()),
            Err(err) => {
                // A newer revision made this change stale; skip it.
                info!(seq = change.seq, %err, "skipping superseded change");
                self.ledger.set_local_seq(change.seq).await;
                Ok(())
            }
        }
    }

    /// Re-upload files the remote reports as corrupted, when our copy is at
    /// least as new as the report.
    pub async fn fix_corrupt_files(&self) -> Result<()> {
        let Some(source) = &self.corruptions else {
            return Ok(());
        };
        let corruptions = source.fetch_file_corruptions().await?;
        info!(count = corruptions.len(), "remote reports corrupted files");
        for corruption in corruptions {
            let Some(doc) = self.ledger.by_remote_id_maybe(&corruption.remote_id).await else {
                continue;
            };
            if !should_reupload(&doc, &corruption) {
                // A newer fix may already be in flight.
                continue;
            }
            info!(path = %doc.path, "re-uploading corrupted file");
            let mut old = doc.clone();
            old.remote = Some(RemoteRef {
                id: corruption.remote_id.clone(),
                rev: corruption.rev,
            });
            let mut fixed = doc.clone();
            match self.remote.overwrite_file(&mut fixed, Some(&old)).await {
                Ok(()) => {
                    if let Err(err) = self.update_revs(fixed, SideName::Local).await {
                        warn!(path = %doc.path, %err, "could not bump revisions after re-upload");
                    }
                }
                Err(err) => error!(path = %doc.path, %err, "failed to fix corrupted file"),
            }
        }
        Ok(())
    }
}

/// Which side must be updated: the one with the lower counter is behind.
/// Equal counters mean there is nothing to do.
fn select_side(doc: &Metadata) -> Option<(SideName, u64)> {
    let local = doc.sides.get(SideName::Local).unwrap_or(0);
    let remote = doc.sides.get(SideName::Remote).unwrap_or(0);
    if local > remote {
        Some((SideName::Remote, remote))
    } else if remote > local {
        Some((SideName::Local, local))
    } else {
        None
    }
}

fn should_reupload(doc: &Metadata, corruption: &FileCorruption) -> bool {
    doc.remote
        .as_ref()
        .is_some_and(|remote| remote.rev >= corruption.rev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Merge;
    use crate::side::{MemorySide, SideOp, StreamSource};
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    fn ts() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    struct Fixture {
        ledger: Arc<Ledger>,
        local: Arc<MemorySide>,
        remote: Arc<MemorySide>,
        merge: Merge,
        engine: SyncEngine,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(Ledger::new());
        let local = Arc::new(MemorySide::new(SideName::Local));
        let remote = Arc::new(MemorySide::new(SideName::Remote));
        let merge = Merge::new(Arc::clone(&ledger), local.clone(), remote.clone());
        let config = SyncConfig::new()
            .with_offline_poll_interval(Duration::from_millis(10))
            .with_trash_parent_delay(Duration::ZERO)
            .with_trash_settle_delay(Duration::ZERO);
        let engine = SyncEngine::new(
            Arc::clone(&ledger),
            local.clone(),
            remote.clone(),
            Ignore::default(),
            Arc::new(EventBus::new()),
            config,
        );
        Fixture {
            ledger,
            local,
            remote,
            merge,
            engine,
        }
    }

    fn file(path: &str) -> Metadata {
        Metadata::new_file(path, "c0ffee", 3, ts())
    }

    #[test]
    fn test_select_side_picks_the_lagging_side() {
        let mut doc = file("a.txt");
        doc.sides.set(SideName::Local, 3);
        doc.sides.set(SideName::Remote, 2);
        assert_eq!(select_side(&doc), Some((SideName::Remote, 2)));

        doc.sides.set(SideName::Remote, 5);
        assert_eq!(select_side(&doc), Some((SideName::Local, 3)));

        doc.sides.set(SideName::Remote, 3);
        assert_eq!(select_side(&doc), None);

        let fresh = file("b.txt");
        assert_eq!(select_side(&fresh), None);
    }

    #[tokio::test]
    async fn test_local_add_is_replayed_to_remote() {
        let fx = fixture();
        let doc = file("a.txt");
        fx.local.insert_file(&doc, b"abc".to_vec());
        fx.merge.add_file(SideName::Local, &doc).await.unwrap();

        fx.engine.sync_once(false).await.unwrap();

        assert_eq!(fx.remote.ops(), vec![SideOp::AddFile("a.txt".into())]);
        let stored = fx.ledger.get("a.txt").await.unwrap();
        assert_eq!(stored.sides.local, stored.sides.remote);
        assert!(stored.remote.is_some(), "remote identity was persisted");

        // Draining again does nothing.
        fx.engine.sync_once(false).await.unwrap();
        assert_eq!(fx.remote.ops().len(), 1);
    }

    #[tokio::test]
    async fn test_both_sides_converge() {
        let fx = fixture();
        let a = file("a.txt");
        fx.local.insert_file(&a, b"aaa".to_vec());
        fx.merge.add_file(SideName::Local, &a).await.unwrap();

        let b = Metadata::new_file("dir/b.txt", "beefed", 3, ts());
        fx.local.insert_file(&b, b"bbb".to_vec());
        fx.merge.add_file(SideName::Local, &b).await.unwrap();

        let c = Metadata::new_file("c.txt", "decade", 3, ts());
        fx.remote.insert_file(&c, b"ccc".to_vec());
        fx.merge.add_file(SideName::Remote, &c).await.unwrap();

        fx.engine.sync_once(false).await.unwrap();

        let remote_tree = fx.remote.tree();
        assert!(remote_tree.contains(&"a.txt".to_string()));
        assert!(remote_tree.contains(&"dir/".to_string()));
        assert!(remote_tree.contains(&"dir/b.txt".to_string()));

        let local_tree = fx.local.tree();
        assert!(local_tree.contains(&"c.txt".to_string()));

        // Transferred bytes came from the owning side.
        let stream = fx.local.create_read_stream(&c).await.unwrap();
        assert_eq!(stream.into_bytes().await.unwrap(), b"ccc");
    }

    #[tokio::test]
    async fn test_remote_content_change_overwrites_local() {
        let fx = fixture();
        let doc = file("a.txt");
        fx.local.insert_file(&doc, b"abc".to_vec());
        fx.merge.add_file(SideName::Local, &doc).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();

        let mut update = Metadata::new_file("a.txt", "facade", 4, ts());
        update.updated_at = "2024-03-02T09:00:00Z".parse().unwrap();
        fx.merge.update_file(SideName::Remote, &update).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();

        assert!(fx
            .local
            .ops()
            .contains(&SideOp::OverwriteFile("a.txt".into())));
    }

    #[tokio::test]
    async fn test_timestamp_only_change_is_not_transferred() {
        let fx = fixture();
        let doc = file("a.txt");
        fx.local.insert_file(&doc, b"abc".to_vec());
        fx.merge.add_file(SideName::Local, &doc).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();
        let remote_ops_before = fx.remote.ops().len();

        let mut touched = file("a.txt");
        touched.updated_at = "2024-03-03T12:00:00Z".parse().unwrap();
        fx.merge.update_file(SideName::Local, &touched).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();

        // No transfer happened, but the counters did converge.
        assert_eq!(fx.remote.ops().len(), remote_ops_before);
        let stored = fx.ledger.get("a.txt").await.unwrap();
        assert_eq!(stored.sides.local, stored.sides.remote);
    }

    #[tokio::test]
    async fn test_move_is_replayed_as_move() {
        let fx = fixture();
        let doc = file("src.txt");
        fx.local.insert_file(&doc, b"abc".to_vec());
        fx.merge.add_file(SideName::Local, &doc).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();

        let was = fx.ledger.get("src.txt").await.unwrap();
        let moved = file("dst.txt");
        fx.merge.move_file(SideName::Local, &moved, &was).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();

        assert!(fx.remote.ops().contains(&SideOp::MoveFile {
            from: "src.txt".into(),
            to: "dst.txt".into(),
        }));
        // No second copy was uploaded.
        assert_eq!(
            fx.remote
                .ops()
                .iter()
                .filter(|op| matches!(op, SideOp::AddFile(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_deletion_never_seen_by_the_side_is_a_noop() {
        let fx = fixture();
        let mut doc = file("a.txt");
        doc.sides.set(SideName::Local, 1);
        doc.deleted = true;
        fx.ledger.put(doc).await.unwrap();

        fx.engine.sync_once(false).await.unwrap();
        assert!(fx.remote.ops().is_empty());
        assert!(fx.ledger.next_change(fx.ledger.get_local_seq().await).await.is_none());
    }

    #[tokio::test]
    async fn test_local_deletion_trashes_remote() {
        let fx = fixture();
        let doc = file("a.txt");
        fx.local.insert_file(&doc, b"abc".to_vec());
        fx.merge.add_file(SideName::Local, &doc).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();

        let was = fx.ledger.get("a.txt").await.unwrap();
        fx.merge.delete_file(SideName::Local, &was).await.unwrap();
        fx.engine.sync_once(false).await.unwrap();

        assert!(fx.remote.ops().contains(&SideOp::Trash("a.txt".into())));
    }

    #[tokio::test]
    async fn test_trashed_document_without_parent_is_trashed_by_itself() {
        let fx = fixture();
        let stored = fx.ledger.put(file("a.txt")).await.unwrap();
        let mut trashed = stored.clone();
        trashed.trashed = true;
        trashed.sides.set(SideName::Local, 2);
        trashed.sides.set(SideName::Remote, 1);
        fx.ledger.put(trashed).await.unwrap();

        fx.engine.sync_once(false).await.unwrap();
        assert!(fx.remote.ops().contains(&SideOp::Trash("a.txt".into())));
    }

    #[tokio::test]
    async fn test_trash_cascades_to_pending_trash_parent() {
        let fx = fixture();
        let folder = fx.ledger.put(Metadata::new_folder("dir", ts())).await.unwrap();
        let mut folder_trashed = folder.clone();
        folder_trashed.trashed = true;
        folder_trashed.sides.set(SideName::Local, 2);
        folder_trashed.sides.set(SideName::Remote, 1);
        let parent = fx.ledger.put(folder_trashed).await.unwrap();

        let stored = fx.ledger.put(file("dir/a.txt")).await.unwrap();
        let mut child = stored.clone();
        child.trashed = true;
        child.sides.set(SideName::Local, 2);
        child.sides.set(SideName::Remote, 1);
        let child = fx.ledger.put(child).await.unwrap();

        let side = Arc::clone(fx.engine.side(SideName::Remote));
        let by_itself = fx
            .engine
            .trash_with_parent_or_by_itself(&child, &side)
            .await
            .unwrap();

        assert!(!by_itself, "the parent covered the child");
        assert!(fx.remote.ops().contains(&SideOp::Trash("dir".into())));
        assert!(!fx.remote.ops().contains(&SideOp::Trash("dir/a.txt".into())));
        assert!(parent.trashed);
    }

    #[tokio::test]
    async fn test_retry_budget_abandons_poisoned_document() {
        let fx = fixture();
        fx.merge.add_file(SideName::Local, &file("a.txt")).await.unwrap();
        fx.remote.fail_times(3, SideError::Io("flaky disk".into()));

        fx.engine.sync_once(false).await.unwrap();

        // Three attempts were made, then the cursor moved past the document.
        assert_eq!(fx.remote.planned_failure_count(), 0);
        assert!(!fx.remote.ops().contains(&SideOp::AddFile("a.txt".into())));
        assert_eq!(fx.ledger.get("a.txt").await.unwrap().errors, 3);
        let seq = fx.ledger.get_local_seq().await;
        assert!(fx.ledger.next_change(seq).await.is_none());
    }

    #[tokio::test]
    async fn test_error_budget_resets_on_success() {
        let fx = fixture();
        fx.merge.add_file(SideName::Local, &file("a.txt")).await.unwrap();
        fx.remote.fail_times(1, SideError::Io("flaky disk".into()));

        fx.engine.sync_once(false).await.unwrap();

        assert!(fx.remote.ops().contains(&SideOp::AddFile("a.txt".into())));
        assert_eq!(fx.ledger.get("a.txt").await.unwrap().errors, 0);
    }

    #[tokio::test]
    async fn test_offline_parks_the_loop_until_recovery() {
        let fx = fixture();
        fx.merge.add_file(SideName::Local, &file("a.txt")).await.unwrap();
        fx.remote.fail_times(1, SideError::Io("connection reset".into()));
        fx.remote
            .set_probe_error(Some(SideError::Io("connection reset".into())));

        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let bus = fx.engine.events();
        let _sub = bus.subscribe(move |event| {
            if let SyncEvent::Offline | SyncEvent::Online = event {
                seen.lock().unwrap().push(format!("{event:?}"));
            }
        });

        let remote = fx.remote.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            remote.set_probe_error(None);
        });

        fx.engine.sync_once(false).await.unwrap();

        let seen = events.lock().unwrap();
        assert_eq!(seen.as_slice(), ["Offline", "Online"]);
        drop(seen);
        // The attempt was not counted, and the retry succeeded.
        assert!(fx.remote.ops().contains(&SideOp::AddFile("a.txt".into())));
        assert_eq!(fx.ledger.get("a.txt").await.unwrap().errors, 0);
    }

    #[tokio::test]
    async fn test_remote_quota_error_is_fatal() {
        let fx = fixture();
        fx.merge.add_file(SideName::Local, &file("a.txt")).await.unwrap();
        fx.remote.fail_times(1, SideError::remote(413, "quota exceeded"));

        let err = fx.engine.sync_once(false).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteQuotaExceeded));
    }

    #[tokio::test]
    async fn test_revoked_client_is_fatal() {
        let fx = fixture();
        fx.merge.add_file(SideName::Local, &file("a.txt")).await.unwrap();
        fx.remote.fail_times(1, SideError::Io("boom".into()));
        fx.remote
            .set_probe_error(Some(SideError::remote(400, "client revoked")));

        let err = fx.engine.sync_once(false).await.unwrap_err();
        assert!(matches!(err, SyncError::ClientRevoked));
    }

    #[tokio::test]
    async fn test_billing_problem_surfaces_structured_details() {
        let fx = fixture();
        fx.merge.add_file(SideName::Local, &file("a.txt")).await.unwrap();
        fx.remote.fail_times(1, SideError::Io("boom".into()));
        fx.remote.set_probe_error(Some(SideError::Remote {
            status: 402,
            message: "payment required".into(),
            details: Some(serde_json::json!({"code": "plan_expired"})),
        }));

        let err = fx.engine.sync_once(false).await.unwrap_err();
        match err {
            SyncError::UserActionRequired { message, details } => {
                assert_eq!(message, "payment required");
                assert_eq!(details.unwrap()["code"], "plan_expired");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_revs_retries_once_on_conflict() {
        let fx = fixture();
        let stored = fx.ledger.put(file("a.txt")).await.unwrap();
        // Another writer advanced the document in the meantime.
        let mut racing = stored.clone();
        racing.size = Some(9);
        fx.ledger.put(racing).await.unwrap();

        fx.engine
            .update_revs(stored, SideName::Remote)
            .await
            .unwrap();

        let current = fx.ledger.get("a.txt").await.unwrap();
        assert_eq!(current.sides.remote, Some(2));
        assert_eq!(current.size, Some(9), "the racing write was kept");
    }

    #[tokio::test]
    async fn test_ignored_documents_are_never_replayed() {
        let fx = fixture();
        fx.merge
            .add_file(SideName::Local, &file(".cache/tmp.txt"))
            .await
            .unwrap();
        fx.engine.sync_once(false).await.unwrap();

        assert!(fx.remote.ops().is_empty());
        let seq = fx.ledger.get_local_seq().await;
        assert!(fx.ledger.next_change(seq).await.is_none());
    }

    struct StaticCorruptions(Vec<FileCorruption>);

    #[async_trait]
    impl CorruptionSource for StaticCorruptions {
        async fn fetch_file_corruptions(&self) -> crate::side::Result<Vec<FileCorruption>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_fix_corrupt_files_reuploads_when_our_copy_is_newer() {
        let ledger = Arc::new(Ledger::new());
        let local = Arc::new(MemorySide::new(SideName::Local));
        let remote = Arc::new(MemorySide::new(SideName::Remote));

        let mut newer = file("fresh.txt");
        newer.remote = Some(RemoteRef { id: "r1".into(), rev: 5 });
        ledger.put(newer).await.unwrap();

        let mut older = file("stale.txt");
        older.remote = Some(RemoteRef { id: "r2".into(), rev: 2 });
        ledger.put(older).await.unwrap();

        let reports = vec![
            FileCorruption {
                remote_id: "r1".into(),
                rev: 4,
                path: "fresh.txt".into(),
                checksum: "c0ffee".into(),
            },
            FileCorruption {
                remote_id: "r2".into(),
                rev: 3,
                path: "stale.txt".into(),
                checksum: "c0ffee".into(),
            },
        ];
        let engine = SyncEngine::new(
            Arc::clone(&ledger),
            local.clone(),
            remote.clone(),
            Ignore::default(),
            Arc::new(EventBus::new()),
            SyncConfig::default(),
        )
        .with_corruption_source(Arc::new(StaticCorruptions(reports)));

        engine.fix_corrupt_files().await.unwrap();

        assert!(remote.ops().contains(&SideOp::OverwriteFile("fresh.txt".into())));
        assert!(!remote.ops().contains(&SideOp::OverwriteFile("stale.txt".into())));
    }

    #[tokio::test]
    async fn test_stop_cancels_the_wait() {
        let fx = fixture();
        fx.engine.stop();
        tokio::time::timeout(Duration::from_secs(1), fx.engine.sync_once(true))
            .await
            .expect("stopped engine should not wait")
            .unwrap();
    }
}
