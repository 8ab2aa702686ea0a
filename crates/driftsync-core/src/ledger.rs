//! The metadata ledger: one document per synchronized path, a change feed
//! ordered by a monotonic sequence number, and the single lock serializing
//! change application.
//!
//! Every write advances the document's `rev` token; a `put` carrying a stale
//! token is rejected so concurrent writers cannot lose updates. The feed
//! keeps one live entry per document, at its latest sequence, and the local
//! cursor records how far the sync loop has consumed it. A JSON snapshot of
//! the whole state can be saved and loaded for persistence across restarts.

use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

/// Prior revisions kept per document for `get_previous_rev`; older ones are
/// pruned and callers must fall back to a full overwrite.
const MAX_HISTORY: usize = 16;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("conflicting write for {0}: stale revision token")]
    Conflict(String),

    #[error("revision {rev} of {id} is unavailable")]
    RevisionUnavailable { id: String, rev: u64 },

    #[error("snapshot io error: {0}")]
    Io(String),

    #[error("snapshot decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// One consumable entry of the change feed.
#[derive(Debug, Clone)]
pub struct Change {
    pub seq: u64,
    pub doc: Metadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    docs: BTreeMap<String, Metadata>,
    history: HashMap<String, Vec<Metadata>>,
    /// seq -> id, one live entry per document.
    feed: BTreeMap<u64, String>,
    doc_seq: HashMap<String, u64>,
    next_seq: u64,
    local_seq: u64,
    remote_seq: Option<String>,
}

impl LedgerState {
    fn new() -> Self {
        LedgerState {
            next_seq: 1,
            ..LedgerState::default()
        }
    }
}

/// The metadata store shared by the merge and sync components.
pub struct Ledger {
    state: RwLock<LedgerState>,
    changed: Notify,
    batch_lock: Arc<Mutex<()>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Ledger {
            state: RwLock::new(LedgerState::new()),
            changed: Notify::new(),
            batch_lock: Arc::new(Mutex::new(())),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Point lookup; tombstones read as absent.
    pub async fn get(&self, id: &str) -> Result<Metadata> {
        self.get_maybe(id)
            .await
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    pub async fn get_maybe(&self, id: &str) -> Option<Metadata> {
        let state = self.read();
        state.docs.get(id).filter(|doc| !doc.deleted).cloned()
    }

    /// All live file documents carrying the given content checksum.
    pub async fn by_checksum(&self, checksum: &str) -> Vec<Metadata> {
        let state = self.read();
        state
            .docs
            .values()
            .filter(|doc| !doc.deleted && doc.checksum.as_deref() == Some(checksum))
            .cloned()
            .collect()
    }

    pub async fn by_remote_id_maybe(&self, remote_id: &str) -> Option<Metadata> {
        let state = self.read();
        state
            .docs
            .values()
            .find(|doc| {
                !doc.deleted
                    && doc
                        .remote
                        .as_ref()
                        .is_some_and(|remote| remote.id == remote_id)
            })
            .cloned()
    }

    /// The archived version of `id` whose revision token is `rev`.
    pub async fn get_previous_rev(&self, id: &str, rev: u64) -> Result<Metadata> {
        let state = self.read();
        state
            .history
            .get(id)
            .and_then(|versions| versions.iter().find(|doc| doc.rev == rev))
            .cloned()
            .ok_or(LedgerError::RevisionUnavailable {
                id: id.to_string(),
                rev,
            })
    }

    /// Every live document, in id order.
    pub async fn all_docs(&self) -> Vec<Metadata> {
        let state = self.read();
        state
            .docs
            .values()
            .filter(|doc| !doc.deleted)
            .cloned()
            .collect()
    }

    /// Live descendants of `id_prefix`, in id order.
    pub async fn by_recursive_path(&self, id_prefix: &str) -> Vec<Metadata> {
        let prefix = format!("{}/", id_prefix.trim_end_matches('/'));
        let state = self.read();
        state
            .docs
            .range(prefix.clone()..)
            .take_while(|(id, _)| id.starts_with(&prefix))
            .filter(|(_, doc)| !doc.deleted)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Store one document, enforcing the optimistic-concurrency token.
    pub async fn put(&self, doc: Metadata) -> Result<Metadata> {
        let stored = {
            let mut state = self.write();
            Self::put_locked(&mut state, doc)?
        };
        self.changed.notify_waiters();
        Ok(stored)
    }

    /// Store several documents, best-effort per document, in a single feed
    /// batch. Descendant ordering given by the caller is preserved.
    pub async fn bulk_docs(&self, docs: Vec<Metadata>) -> Vec<Result<Metadata>> {
        let results = {
            let mut state = self.write();
            docs.into_iter()
                .map(|doc| Self::put_locked(&mut state, doc))
                .collect()
        };
        self.changed.notify_waiters();
        results
    }

    fn put_locked(state: &mut LedgerState, mut doc: Metadata) -> Result<Metadata> {
        match state.docs.get(&doc.id) {
            Some(current) if current.rev != doc.rev => {
                return Err(LedgerError::Conflict(doc.id.clone()));
            }
            Some(current) => {
                let versions = state.history.entry(doc.id.clone()).or_default();
                versions.push(current.clone());
                if versions.len() > MAX_HISTORY {
                    versions.remove(0);
                }
            }
            None if doc.rev != 0 => {
                return Err(LedgerError::Conflict(doc.id.clone()));
            }
            None => {}
        }
        doc.rev += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        if let Some(old_seq) = state.doc_seq.insert(doc.id.clone(), seq) {
            state.feed.remove(&old_seq);
        }
        state.feed.insert(seq, doc.id.clone());
        state.docs.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    /// The next unconsumed change after `since`, if any.
    pub async fn next_change(&self, since: u64) -> Option<Change> {
        let state = self.read();
        state
            .feed
            .range(since + 1..)
            .next()
            .and_then(|(seq, id)| {
                state.docs.get(id).map(|doc| Change {
                    seq: *seq,
                    doc: doc.clone(),
                })
            })
    }

    fn has_change(&self, since: u64) -> bool {
        self.read().feed.range(since + 1..).next().is_some()
    }

    /// Block until a change past `since` exists.
    pub async fn wait_for_change(&self, since: u64) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.has_change(since) {
                return;
            }
            notified.await;
        }
    }

    pub async fn get_local_seq(&self) -> u64 {
        self.read().local_seq
    }

    pub async fn set_local_seq(&self, seq: u64) {
        self.write().local_seq = seq;
    }

    pub async fn get_remote_seq(&self) -> Option<String> {
        self.read().remote_seq.clone()
    }

    pub async fn set_remote_seq(&self, seq: String) {
        self.write().remote_seq = Some(seq);
    }

    /// The single global mutual-exclusion token: at most one batch of changes
    /// is applied at a time.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.batch_lock).lock_owned().await
    }

    /// Drop tombstones that both sides have already consumed. Returns how
    /// many documents were removed.
    pub async fn compact(&self) -> usize {
        let mut state = self.write();
        let local_seq = state.local_seq;
        let stale: Vec<String> = state
            .docs
            .iter()
            .filter(|(id, doc)| {
                doc.deleted
                    && state
                        .doc_seq
                        .get(*id)
                        .is_some_and(|seq| *seq <= local_seq)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            state.docs.remove(id);
            state.history.remove(id);
            if let Some(seq) = state.doc_seq.remove(id) {
                state.feed.remove(&seq);
            }
        }
        stale.len()
    }

    /// Write a JSON snapshot of the whole ledger state.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::Io(e.to_string()))?;
        }
        let state = self.read();
        let contents =
            serde_json::to_string_pretty(&*state).map_err(|e| LedgerError::Decode(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| LedgerError::Io(e.to_string()))
    }

    /// Load a previously saved snapshot; a missing file yields a fresh ledger.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Ledger::new());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| LedgerError::Io(e.to_string()))?;
        let state: LedgerState =
            serde_json::from_str(&contents).map_err(|e| LedgerError::Decode(e.to_string()))?;
        Ok(Ledger {
            state: RwLock::new(state),
            changed: Notify::new(),
            batch_lock: Arc::new(Mutex::new(())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DocType, SideName};
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    fn ts() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    fn file(path: &str) -> Metadata {
        Metadata::new_file(path, "c0ffee", 3, ts())
    }

    #[tokio::test]
    async fn test_put_assigns_revision_tokens() {
        let ledger = Ledger::new();
        let stored = ledger.put(file("a.txt")).await.unwrap();
        assert_eq!(stored.rev, 1);

        let mut next = stored.clone();
        next.size = Some(9);
        let stored = ledger.put(next).await.unwrap();
        assert_eq!(stored.rev, 2);
    }

    #[tokio::test]
    async fn test_put_rejects_stale_revision() {
        let ledger = Ledger::new();
        let stored = ledger.put(file("a.txt")).await.unwrap();

        let mut stale = stored.clone();
        stale.rev = 0;
        assert!(matches!(
            ledger.put(stale).await,
            Err(LedgerError::Conflict(_))
        ));

        // A never-stored doc claiming a revision is stale too.
        let mut phantom = file("b.txt");
        phantom.rev = 3;
        assert!(matches!(
            ledger.put(phantom).await,
            Err(LedgerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_feed_keeps_one_entry_per_document() {
        let ledger = Ledger::new();
        let a = ledger.put(file("a.txt")).await.unwrap();
        ledger.put(file("b.txt")).await.unwrap();
        let mut a2 = a.clone();
        a2.size = Some(5);
        ledger.put(a2).await.unwrap();

        // a's original entry was superseded: b first, then a at its new seq.
        let first = ledger.next_change(0).await.unwrap();
        assert_eq!(first.doc.id, "b.txt");
        let second = ledger.next_change(first.seq).await.unwrap();
        assert_eq!(second.doc.id, "a.txt");
        assert_eq!(second.doc.size, Some(5));
        assert!(ledger.next_change(second.seq).await.is_none());
    }

    #[tokio::test]
    async fn test_get_previous_rev() {
        let ledger = Ledger::new();
        let v1 = ledger.put(file("a.txt")).await.unwrap();
        let mut v2 = v1.clone();
        v2.checksum = Some("facade".into());
        ledger.put(v2).await.unwrap();

        let old = ledger.get_previous_rev("a.txt", 1).await.unwrap();
        assert_eq!(old.checksum.as_deref(), Some("c0ffee"));
        assert!(matches!(
            ledger.get_previous_rev("a.txt", 9).await,
            Err(LedgerError::RevisionUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_by_recursive_path_excludes_tombstones_and_siblings() {
        let ledger = Ledger::new();
        ledger.put(Metadata::new_folder("dir", ts())).await.unwrap();
        ledger
            .put(Metadata::new_folder("dir/sub", ts()))
            .await
            .unwrap();
        ledger.put(file("dir/sub/a.txt")).await.unwrap();
        ledger.put(file("dir2/b.txt")).await.unwrap();
        let mut gone = ledger.put(file("dir/gone.txt")).await.unwrap();
        gone.deleted = true;
        ledger.put(gone).await.unwrap();

        let ids: Vec<String> = ledger
            .by_recursive_path("dir")
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["dir/sub", "dir/sub/a.txt"]);
    }

    #[tokio::test]
    async fn test_tombstones_read_as_absent_but_flow_through_feed() {
        let ledger = Ledger::new();
        let mut doc = ledger.put(file("a.txt")).await.unwrap();
        doc.deleted = true;
        ledger.put(doc).await.unwrap();

        assert!(ledger.get_maybe("a.txt").await.is_none());
        let change = ledger.next_change(0).await.unwrap();
        assert!(change.doc.deleted);
    }

    #[tokio::test]
    async fn test_wait_for_change_wakes_on_put() {
        let ledger = Arc::new(Ledger::new());
        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.wait_for_change(0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ledger.put(file("a.txt")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_serializes_batches() {
        let ledger = Arc::new(Ledger::new());
        let running = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let ledger = Arc::clone(&ledger);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _guard = ledger.lock().await;
                let now = running.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compact_drops_consumed_tombstones() {
        let ledger = Ledger::new();
        let mut doc = ledger.put(file("a.txt")).await.unwrap();
        doc.deleted = true;
        doc.sides.set(SideName::Local, 2);
        doc.sides.set(SideName::Remote, 2);
        let stored = ledger.put(doc).await.unwrap();

        // Not consumed yet: kept.
        assert_eq!(ledger.compact().await, 0);

        let change = ledger.next_change(0).await.unwrap();
        assert_eq!(change.seq, 2);
        ledger.set_local_seq(change.seq).await;
        assert_eq!(ledger.compact().await, 1);
        assert!(ledger.next_change(0).await.is_none());
        assert_eq!(stored.doc_type, DocType::File);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state/ledger.json");

        let ledger = Ledger::new();
        let stored = ledger.put(file("a.txt")).await.unwrap();
        ledger.set_local_seq(1).await;
        ledger.save(&path).unwrap();

        let loaded = Ledger::load(&path).unwrap();
        assert_eq!(loaded.get("a.txt").await.unwrap(), stored);
        assert_eq!(loaded.get_local_seq().await, 1);

        // Missing snapshot yields a fresh ledger.
        let fresh = Ledger::load(&dir.path().join("absent.json")).unwrap();
        assert!(fresh.get_maybe("a.txt").await.is_none());
    }
}
