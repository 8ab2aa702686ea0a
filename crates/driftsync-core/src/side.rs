//! The side capability interface, implemented once per synchronized endpoint.
//!
//! Implementations:
//! - `MemorySide` - For testing
//! - `LocalSide` (in driftsync-daemon) - Local filesystem via tokio::fs
//! - `RemoteSide` (in driftsync-daemon) - Remote document store over HTTP
//!
//! Content transfer flows through `StreamSource`: the sync engine hands each
//! side a capability handle to the other side at wiring time, so a side adds
//! a file by pulling the bytes from its counterpart's stream.

use crate::metadata::{DocType, Metadata, RemoteRef, SideName};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Error)]
pub enum SideError {
    #[error("no space left on device")]
    NoSpaceLeft,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("remote request failed ({status}): {message}")]
    Remote {
        status: u16,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("io error: {0}")]
    Io(String),
}

impl SideError {
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::StorageFull => SideError::NoSpaceLeft,
            std::io::ErrorKind::NotFound => SideError::NotFound(err.to_string()),
            _ => SideError::Io(err.to_string()),
        }
    }

    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        SideError::Remote {
            status,
            message: message.into(),
            details: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SideError>;

/// A readable byte stream with a known length.
pub struct ContentStream {
    pub length: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ContentStream {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ContentStream {
            length: bytes.len() as u64,
            reader: Box::new(std::io::Cursor::new(bytes)),
        }
    }

    /// Drain the stream into memory.
    pub async fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.length as usize);
        self.reader
            .read_to_end(&mut buffer)
            .await
            .map_err(SideError::from_io)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("length", &self.length)
            .finish()
    }
}

/// Content-transfer capability each side exposes to its counterpart.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn create_read_stream(&self, doc: &Metadata) -> Result<ContentStream>;
}

/// Operations the sync engine replays onto a lagging side.
///
/// Mutating operations take `&mut Metadata` so an adapter can record the
/// identities it assigns (remote id/rev, inode); the engine persists the
/// updated document afterwards.
#[async_trait]
pub trait Side: StreamSource {
    fn name(&self) -> SideName;

    /// Receive the capability handle to the other side, wired once by the
    /// sync engine at construction.
    fn connect_source(&self, other: Arc<dyn Side>);

    async fn add_file(&self, doc: &mut Metadata) -> Result<()>;
    async fn add_folder(&self, doc: &mut Metadata) -> Result<()>;
    async fn overwrite_file(&self, doc: &mut Metadata, old: Option<&Metadata>) -> Result<()>;
    async fn update_file_metadata(&self, doc: &mut Metadata, old: &Metadata) -> Result<()>;
    async fn update_folder(&self, doc: &mut Metadata, old: &Metadata) -> Result<()>;
    async fn move_file(&self, doc: &mut Metadata, old: &Metadata) -> Result<()>;
    async fn move_folder(&self, doc: &mut Metadata, old: &Metadata) -> Result<()>;

    /// Refresh the side-owned revision of a document that was relocated as
    /// part of a bulk ancestor move.
    async fn assign_new_rev(&self, doc: &mut Metadata) -> Result<()>;

    async fn trash(&self, doc: &Metadata) -> Result<()>;
    async fn delete_folder(&self, doc: &Metadata) -> Result<()>;
    async fn rename_conflicting_doc(&self, doc: &Metadata, new_path: &str) -> Result<()>;

    /// Reachability/quota probe used by error classification. The local side
    /// answers trivially; the remote side asks the store.
    async fn probe(&self) -> Result<()>;
}

/// One operation observed by a `MemorySide`, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideOp {
    AddFile(String),
    AddFolder(String),
    OverwriteFile(String),
    UpdateFileMetadata(String),
    UpdateFolder(String),
    MoveFile { from: String, to: String },
    MoveFolder { from: String, to: String },
    AssignNewRev(String),
    Trash(String),
    DeleteFolder(String),
    RenameConflicting { from: String, to: String },
}

#[derive(Default)]
struct MemoryState {
    /// id -> content bytes
    files: HashMap<String, Vec<u8>>,
    /// id -> display path
    paths: HashMap<String, String>,
    folders: HashSet<String>,
    ops: Vec<SideOp>,
    planned_failures: VecDeque<SideError>,
    probe_error: Option<SideError>,
    next_rev: u64,
}

/// In-memory side for testing: records every operation, keeps a toy tree,
/// and can be scripted to fail.
pub struct MemorySide {
    name: SideName,
    state: RwLock<MemoryState>,
    source: OnceLock<Arc<dyn Side>>,
}

impl MemorySide {
    pub fn new(name: SideName) -> Self {
        MemorySide {
            name,
            state: RwLock::new(MemoryState::default()),
            source: OnceLock::new(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Script the next operation(s) to fail with clones of `err`.
    pub fn fail_times(&self, times: usize, err: SideError) {
        let mut state = self.write();
        for _ in 0..times {
            state.planned_failures.push_back(err.clone());
        }
    }

    /// Scripted failures not yet consumed.
    pub fn planned_failure_count(&self) -> usize {
        self.read().planned_failures.len()
    }

    /// Make `probe()` fail until cleared with `None`.
    pub fn set_probe_error(&self, err: Option<SideError>) {
        self.write().probe_error = err;
    }

    /// Seed content, as if the entry already existed on this side.
    pub fn insert_file(&self, doc: &Metadata, bytes: Vec<u8>) {
        let mut state = self.write();
        state.files.insert(doc.id.clone(), bytes);
        state.paths.insert(doc.id.clone(), doc.path.clone());
    }

    /// Every operation observed so far.
    pub fn ops(&self) -> Vec<SideOp> {
        self.read().ops.clone()
    }

    /// Display paths present on this side, folders suffixed with `/`.
    pub fn tree(&self) -> Vec<String> {
        let state = self.read();
        let mut entries: BTreeMap<String, String> = BTreeMap::new();
        for id in &state.folders {
            let path = state.paths.get(id).cloned().unwrap_or_else(|| id.clone());
            entries.insert(id.clone(), format!("{path}/"));
        }
        for id in state.files.keys() {
            let path = state.paths.get(id).cloned().unwrap_or_else(|| id.clone());
            entries.insert(id.clone(), path);
        }
        entries.into_values().collect()
    }

    fn check_failure(&self) -> Result<()> {
        match self.write().planned_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, op: SideOp) {
        self.write().ops.push(op);
    }

    async fn pull_content(&self, doc: &Metadata) -> Vec<u8> {
        if let Some(source) = self.source.get() {
            if let Ok(stream) = source.create_read_stream(doc).await {
                if let Ok(bytes) = stream.into_bytes().await {
                    return bytes;
                }
            }
        }
        // No counterpart content available: stand in with the checksum so
        // same-binary assertions still hold.
        doc.checksum.clone().unwrap_or_default().into_bytes()
    }

    fn rename_prefix(&self, old_id: &str, old_path: &str, new_id: &str, new_path: &str) {
        let mut state = self.write();
        let moved: Vec<String> = state
            .files
            .keys()
            .chain(state.folders.iter())
            .filter(|id| id.as_str() == old_id || id.starts_with(&format!("{old_id}/")))
            .cloned()
            .collect();
        for id in moved {
            let renamed_id = format!("{new_id}{}", &id[old_id.len()..]);
            if let Some(bytes) = state.files.remove(&id) {
                state.files.insert(renamed_id.clone(), bytes);
            }
            if state.folders.remove(&id) {
                state.folders.insert(renamed_id.clone());
            }
            if let Some(path) = state.paths.remove(&id) {
                let renamed_path = format!("{new_path}{}", &path[old_path.len()..]);
                state.paths.insert(renamed_id, renamed_path);
            }
        }
    }
}

#[async_trait]
impl StreamSource for MemorySide {
    async fn create_read_stream(&self, doc: &Metadata) -> Result<ContentStream> {
        let state = self.read();
        match state.files.get(&doc.id) {
            Some(bytes) => Ok(ContentStream::from_bytes(bytes.clone())),
            None => Err(SideError::NotFound(doc.path.clone())),
        }
    }
}

#[async_trait]
impl Side for MemorySide {
    fn name(&self) -> SideName {
        self.name
    }

    fn connect_source(&self, other: Arc<dyn Side>) {
        let _ = self.source.set(other);
    }

    async fn add_file(&self, doc: &mut Metadata) -> Result<()> {
        self.check_failure()?;
        let bytes = self.pull_content(doc).await;
        {
            let mut state = self.write();
            state.files.insert(doc.id.clone(), bytes);
            state.paths.insert(doc.id.clone(), doc.path.clone());
        }
        self.assign_identity(doc);
        self.record(SideOp::AddFile(doc.path.clone()));
        Ok(())
    }

    async fn add_folder(&self, doc: &mut Metadata) -> Result<()> {
        self.check_failure()?;
        {
            let mut state = self.write();
            state.folders.insert(doc.id.clone());
            state.paths.insert(doc.id.clone(), doc.path.clone());
        }
        self.assign_identity(doc);
        self.record(SideOp::AddFolder(doc.path.clone()));
        Ok(())
    }

    async fn overwrite_file(&self, doc: &mut Metadata, _old: Option<&Metadata>) -> Result<()> {
        self.check_failure()?;
        let bytes = self.pull_content(doc).await;
        {
            let mut state = self.write();
            state.files.insert(doc.id.clone(), bytes);
            state.paths.insert(doc.id.clone(), doc.path.clone());
        }
        self.assign_identity(doc);
        self.record(SideOp::OverwriteFile(doc.path.clone()));
        Ok(())
    }

    async fn update_file_metadata(&self, doc: &mut Metadata, _old: &Metadata) -> Result<()> {
        self.check_failure()?;
        self.record(SideOp::UpdateFileMetadata(doc.path.clone()));
        Ok(())
    }

    async fn update_folder(&self, doc: &mut Metadata, _old: &Metadata) -> Result<()> {
        self.check_failure()?;
        self.write().folders.insert(doc.id.clone());
        self.record(SideOp::UpdateFolder(doc.path.clone()));
        Ok(())
    }

    async fn move_file(&self, doc: &mut Metadata, old: &Metadata) -> Result<()> {
        self.check_failure()?;
        {
            let mut state = self.write();
            if let Some(bytes) = state.files.remove(&old.id) {
                state.files.insert(doc.id.clone(), bytes);
            }
            state.paths.remove(&old.id);
            state.paths.insert(doc.id.clone(), doc.path.clone());
        }
        self.record(SideOp::MoveFile {
            from: old.path.clone(),
            to: doc.path.clone(),
        });
        Ok(())
    }

    async fn move_folder(&self, doc: &mut Metadata, old: &Metadata) -> Result<()> {
        self.check_failure()?;
        self.rename_prefix(&old.id, &old.path, &doc.id, &doc.path);
        self.write().folders.insert(doc.id.clone());
        self.write()
            .paths
            .insert(doc.id.clone(), doc.path.clone());
        self.record(SideOp::MoveFolder {
            from: old.path.clone(),
            to: doc.path.clone(),
        });
        Ok(())
    }

    async fn assign_new_rev(&self, doc: &mut Metadata) -> Result<()> {
        self.check_failure()?;
        if self.name == SideName::Remote {
            let rev = {
                let mut state = self.write();
                state.next_rev += 1;
                state.next_rev
            };
            let id = doc
                .remote
                .as_ref()
                .map(|r| r.id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            doc.remote = Some(RemoteRef { id, rev });
        }
        self.record(SideOp::AssignNewRev(doc.path.clone()));
        Ok(())
    }

    async fn trash(&self, doc: &Metadata) -> Result<()> {
        self.check_failure()?;
        {
            let mut state = self.write();
            state.files.remove(&doc.id);
            state.folders.remove(&doc.id);
            state.paths.remove(&doc.id);
        }
        self.record(SideOp::Trash(doc.path.clone()));
        Ok(())
    }

    async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
        self.check_failure()?;
        {
            let mut state = self.write();
            state.folders.remove(&doc.id);
            state.paths.remove(&doc.id);
        }
        self.record(SideOp::DeleteFolder(doc.path.clone()));
        Ok(())
    }

    async fn rename_conflicting_doc(&self, doc: &Metadata, new_path: &str) -> Result<()> {
        self.check_failure()?;
        let new_id = crate::metadata::id_from_path(new_path);
        self.rename_prefix(&doc.id, &doc.path, &new_id, new_path);
        self.record(SideOp::RenameConflicting {
            from: doc.path.clone(),
            to: new_path.to_string(),
        });
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        match self.read().probe_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl MemorySide {
    fn assign_identity(&self, doc: &mut Metadata) {
        match self.name {
            SideName::Remote => {
                let rev = {
                    let mut state = self.write();
                    state.next_rev += 1;
                    state.next_rev
                };
                let id = doc
                    .remote
                    .as_ref()
                    .map(|r| r.id.clone())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                doc.remote = Some(RemoteRef { id, rev });
            }
            SideName::Local => {
                if doc.ino.is_none() && doc.doc_type == DocType::File {
                    let next = self.read().files.len() as u64;
                    doc.ino = Some(next + 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ts() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_side_transfers_content_from_counterpart() {
        let local: Arc<MemorySide> = Arc::new(MemorySide::new(SideName::Local));
        let remote: Arc<MemorySide> = Arc::new(MemorySide::new(SideName::Remote));
        local.connect_source(remote.clone());
        remote.connect_source(local.clone());

        let mut doc = Metadata::new_file("a.txt", "c0ffee", 5, ts());
        remote.insert_file(&doc, b"hello".to_vec());

        local.add_file(&mut doc).await.unwrap();
        let stream = local.create_read_stream(&doc).await.unwrap();
        assert_eq!(stream.length, 5);
        assert_eq!(stream.into_bytes().await.unwrap(), b"hello");
        assert_eq!(local.ops(), vec![SideOp::AddFile("a.txt".into())]);
    }

    #[tokio::test]
    async fn test_memory_side_scripted_failures() {
        let side = MemorySide::new(SideName::Remote);
        side.fail_times(2, SideError::Io("flaky".into()));

        let mut doc = Metadata::new_file("a.txt", "c0ffee", 3, ts());
        assert!(side.add_file(&mut doc).await.is_err());
        assert!(side.add_file(&mut doc).await.is_err());
        assert!(side.add_file(&mut doc).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_side_assigns_remote_identity() {
        let side = MemorySide::new(SideName::Remote);
        let mut doc = Metadata::new_file("a.txt", "c0ffee", 3, ts());
        side.add_file(&mut doc).await.unwrap();
        let first = doc.remote.clone().unwrap();

        side.assign_new_rev(&mut doc).await.unwrap();
        let second = doc.remote.clone().unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.rev > first.rev);
    }

    #[tokio::test]
    async fn test_memory_side_moves_folders_recursively() {
        let side = MemorySide::new(SideName::Local);
        let mut dir = Metadata::new_folder("src/dir", ts());
        side.add_folder(&mut dir).await.unwrap();
        let file = Metadata::new_file("src/dir/a.txt", "c0ffee", 3, ts());
        side.insert_file(&file, b"abc".to_vec());

        let mut moved = Metadata::new_folder("dst/dir", ts());
        side.move_folder(&mut moved, &dir).await.unwrap();

        assert_eq!(side.tree(), vec!["dst/dir/", "dst/dir/a.txt"]);
    }
}
