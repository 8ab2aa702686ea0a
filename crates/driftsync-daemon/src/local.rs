//! Local filesystem side adapter, built on tokio::fs.
//!
//! Downloads go through a temp file: the bytes are pulled from the remote's
//! stream (or recopied from an existing local file with the same checksum),
//! verified against the document's checksum, and only then renamed into
//! place. Trashed entries move into the state directory's trash area so a
//! restore stays possible.

use crate::digest;
use async_trait::async_trait;
use chrono::Utc;
use driftsync_core::events::{EventBus, SyncEvent};
use driftsync_core::ledger::Ledger;
use driftsync_core::metadata::{DocType, Metadata, SideName, is_up_to_date};
use driftsync_core::side::{ContentStream, Result, Side, SideError, StreamSource};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

pub struct LocalSide {
    sync_dir: PathBuf,
    state_dir: PathBuf,
    ledger: Arc<Ledger>,
    events: Arc<EventBus>,
    source: OnceLock<Arc<dyn Side>>,
}

impl LocalSide {
    pub fn new(
        sync_dir: PathBuf,
        state_dir: PathBuf,
        ledger: Arc<Ledger>,
        events: Arc<EventBus>,
    ) -> Self {
        LocalSide {
            sync_dir,
            state_dir,
            ledger,
            events,
            source: OnceLock::new(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.sync_dir.clone()
        } else {
            self.sync_dir.join(path)
        }
    }

    fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }

    fn trash_dir(&self) -> PathBuf {
        self.state_dir.join("trash")
    }

    /// An up-to-date local file with the same checksum, if one exists; the
    /// copy is cheaper than a download.
    async fn file_with_same_checksum(&self, checksum: &str) -> Option<PathBuf> {
        for doc in self.ledger.by_checksum(checksum).await {
            if !is_up_to_date(SideName::Local, &doc) {
                continue;
            }
            let candidate = self.full_path(&doc.path);
            if fs::metadata(&candidate).await.is_ok() {
                return Some(candidate);
            }
        }
        None
    }

    /// chmod +x when the file is executable, and set the modification time.
    /// Both are best-effort.
    async fn update_metadata(&self, doc: &Metadata) -> Result<()> {
        let path = self.full_path(&doc.path);
        #[cfg(unix)]
        if doc.executable {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(SideError::from_io)?;
        }
        let mtime = std::time::SystemTime::from(doc.updated_at);
        if let Ok(file) = std::fs::File::options().write(true).open(&path) {
            let _ = file.set_modified(mtime);
        }
        Ok(())
    }

    async fn record_ino(&self, doc: &mut Metadata) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = fs::metadata(self.full_path(&doc.path)).await {
                doc.ino = Some(meta.ino());
            }
        }
        #[cfg(not(unix))]
        {
            let _ = doc;
        }
    }

    async fn ensure_not_exists(&self, path: &Path) -> Result<()> {
        match fs::metadata(path).await {
            Ok(_) => Err(SideError::AlreadyExists(path.display().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SideError::from_io(err)),
        }
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let from = self.full_path(old_path);
        let to = self.full_path(new_path);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await.map_err(SideError::from_io)?;
        }
        fs::rename(&from, &to).await.map_err(SideError::from_io)
    }

    async fn write_through_tmp(&self, doc: &Metadata) -> Result<()> {
        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir).await.map_err(SideError::from_io)?;
        let name = doc.path.rsplit('/').next().unwrap_or(&doc.path);
        let tmp = tmp_dir.join(format!("{name}.tmp"));

        let copied = match &doc.checksum {
            Some(checksum) => self.file_with_same_checksum(checksum).await,
            None => None,
        };
        match copied {
            Some(existing) => {
                info!(path = %doc.path, from = %existing.display(), "recopying local content");
                self.events.emit(SyncEvent::TransferCopy {
                    path: doc.path.clone(),
                });
                fs::copy(&existing, &tmp).await.map_err(SideError::from_io)?;
            }
            None => {
                let source = self
                    .source
                    .get()
                    .ok_or_else(|| SideError::Io("no counterpart side wired".into()))?;
                let mut stream = source.create_read_stream(doc).await?;
                let mut out = fs::File::create(&tmp).await.map_err(SideError::from_io)?;
                tokio::io::copy(&mut stream.reader, &mut out)
                    .await
                    .map_err(SideError::from_io)?;
                out.flush().await.map_err(SideError::from_io)?;
            }
        }

        if let Some(checksum) = &doc.checksum {
            let actual = digest::file_sha256(&tmp)
                .await
                .map_err(SideError::from_io)?;
            if actual != *checksum {
                let _ = fs::remove_file(&tmp).await;
                return Err(SideError::ChecksumMismatch(doc.path.clone()));
            }
        }

        let dest = self.full_path(&doc.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(SideError::from_io)?;
        }
        fs::rename(&tmp, &dest).await.map_err(SideError::from_io)
    }
}

#[async_trait]
impl StreamSource for LocalSide {
    async fn create_read_stream(&self, doc: &Metadata) -> Result<ContentStream> {
        let path = self.full_path(&doc.path);
        let meta = fs::metadata(&path).await.map_err(SideError::from_io)?;
        let file = fs::File::open(&path).await.map_err(SideError::from_io)?;
        Ok(ContentStream {
            length: meta.len(),
            reader: Box::new(file),
        })
    }
}

#[async_trait]
impl Side for LocalSide {
    fn name(&self) -> SideName {
        SideName::Local
    }

    fn connect_source(&self, other: Arc<dyn Side>) {
        let _ = self.source.set(other);
    }

    async fn add_file(&self, doc: &mut Metadata) -> Result<()> {
        info!(path = %doc.path, "writing file");
        self.write_through_tmp(doc).await?;
        self.record_ino(doc).await;
        self.update_metadata(doc).await
    }

    async fn add_folder(&self, doc: &mut Metadata) -> Result<()> {
        info!(path = %doc.path, "creating folder");
        fs::create_dir_all(self.full_path(&doc.path))
            .await
            .map_err(SideError::from_io)?;
        self.record_ino(doc).await;
        Ok(())
    }

    async fn overwrite_file(&self, doc: &mut Metadata, _old: Option<&Metadata>) -> Result<()> {
        self.add_file(doc).await
    }

    async fn update_file_metadata(&self, doc: &mut Metadata, _old: &Metadata) -> Result<()> {
        info!(path = %doc.path, "updating file metadata");
        self.update_metadata(doc).await
    }

    async fn update_folder(&self, doc: &mut Metadata, _old: &Metadata) -> Result<()> {
        self.add_folder(doc).await
    }

    async fn move_file(&self, doc: &mut Metadata, old: &Metadata) -> Result<()> {
        info!(path = %doc.path, oldpath = %old.path, "moving file");
        if doc.id != old.id {
            self.ensure_not_exists(&self.full_path(&doc.path)).await?;
        }
        self.rename(&old.path, &doc.path).await?;
        self.update_metadata(doc).await?;
        if doc.checksum != old.checksum {
            // The content changed while the entry moved.
            self.overwrite_file(doc, None).await?;
        }
        Ok(())
    }

    async fn move_folder(&self, doc: &mut Metadata, old: &Metadata) -> Result<()> {
        info!(path = %doc.path, oldpath = %old.path, "moving folder");
        if doc.id != old.id {
            self.ensure_not_exists(&self.full_path(&doc.path)).await?;
        }
        self.rename(&old.path, &doc.path).await
    }

    async fn assign_new_rev(&self, _doc: &mut Metadata) -> Result<()> {
        // The filesystem has no revision of its own to refresh.
        Ok(())
    }

    async fn trash(&self, doc: &Metadata) -> Result<()> {
        info!(path = %doc.path, "moving to the trash area");
        let trash_dir = self.trash_dir();
        fs::create_dir_all(&trash_dir)
            .await
            .map_err(SideError::from_io)?;
        let name = doc.path.rsplit('/').next().unwrap_or(&doc.path);
        let target = trash_dir.join(format!("{}-{}", Utc::now().timestamp_millis(), name));
        fs::rename(self.full_path(&doc.path), &target)
            .await
            .map_err(SideError::from_io)
    }

    async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
        if doc.doc_type != DocType::Folder {
            return Err(SideError::Io(format!("not folder metadata: {}", doc.path)));
        }
        let path = self.full_path(&doc.path);
        match fs::remove_dir(&path).await {
            Ok(()) => {
                info!(path = %doc.path, "deleted empty folder");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                warn!(path = %doc.path, "folder is not empty, trashing it instead");
                self.trash(doc).await
            }
            Err(err) => Err(SideError::from_io(err)),
        }
    }

    async fn rename_conflicting_doc(&self, doc: &Metadata, new_path: &str) -> Result<()> {
        info!(path = %doc.path, new_path, "renaming to resolve a conflict");
        self.rename(&doc.path, new_path).await
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use driftsync_core::side::MemorySide;
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        "2024-03-01T10:00:00Z".parse().unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        sync_dir: PathBuf,
        side: Arc<LocalSide>,
        remote: Arc<MemorySide>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let sync_dir = dir.path().join("tree");
        std::fs::create_dir_all(&sync_dir).unwrap();
        let state_dir = dir.path().join("state");
        let side = Arc::new(LocalSide::new(
            sync_dir.clone(),
            state_dir,
            Arc::new(Ledger::new()),
            Arc::new(EventBus::new()),
        ));
        let remote = Arc::new(MemorySide::new(SideName::Remote));
        side.connect_source(remote.clone());
        Fixture {
            _dir: dir,
            sync_dir,
            side,
            remote,
        }
    }

    #[tokio::test]
    async fn test_add_file_downloads_verifies_and_renames() {
        let fx = fixture();
        let checksum = digest::bytes_sha256(b"hello");
        let mut doc = Metadata::new_file("docs/a.txt", checksum, 5, ts());
        fx.remote.insert_file(&doc, b"hello".to_vec());

        fx.side.add_file(&mut doc).await.unwrap();

        let written = std::fs::read(fx.sync_dir.join("docs/a.txt")).unwrap();
        assert_eq!(written, b"hello");
        #[cfg(unix)]
        assert!(doc.ino.is_some());
    }

    #[tokio::test]
    async fn test_add_file_rejects_corrupt_download() {
        let fx = fixture();
        let mut doc = Metadata::new_file("a.txt", "0".repeat(64), 5, ts());
        fx.remote.insert_file(&doc, b"hello".to_vec());

        let err = fx.side.add_file(&mut doc).await.unwrap_err();
        assert!(matches!(err, SideError::ChecksumMismatch(_)));
        assert!(!fx.sync_dir.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_move_file_refuses_occupied_destination() {
        let fx = fixture();
        std::fs::write(fx.sync_dir.join("src.txt"), b"abc").unwrap();
        std::fs::write(fx.sync_dir.join("dst.txt"), b"xyz").unwrap();

        let old = Metadata::new_file("src.txt", digest::bytes_sha256(b"abc"), 3, ts());
        let mut doc = Metadata::new_file("dst.txt", digest::bytes_sha256(b"abc"), 3, ts());
        let err = fx.side.move_file(&mut doc, &old).await.unwrap_err();
        assert!(matches!(err, SideError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_move_file_renames_in_place() {
        let fx = fixture();
        std::fs::create_dir_all(fx.sync_dir.join("src")).unwrap();
        std::fs::write(fx.sync_dir.join("src/a.txt"), b"abc").unwrap();

        let old = Metadata::new_file("src/a.txt", digest::bytes_sha256(b"abc"), 3, ts());
        let mut doc = Metadata::new_file("dst/a.txt", digest::bytes_sha256(b"abc"), 3, ts());
        fx.side.move_file(&mut doc, &old).await.unwrap();

        assert!(!fx.sync_dir.join("src/a.txt").exists());
        assert_eq!(std::fs::read(fx.sync_dir.join("dst/a.txt")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_trash_moves_into_state_trash_area() {
        let fx = fixture();
        std::fs::write(fx.sync_dir.join("a.txt"), b"abc").unwrap();
        let doc = Metadata::new_file("a.txt", digest::bytes_sha256(b"abc"), 3, ts());

        fx.side.trash(&doc).await.unwrap();

        assert!(!fx.sync_dir.join("a.txt").exists());
        let trash = fx._dir.path().join("state/trash");
        let entries: Vec<_> = std::fs::read_dir(&trash).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_folder_trashes_non_empty_folders() {
        let fx = fixture();
        std::fs::create_dir_all(fx.sync_dir.join("dir")).unwrap();
        std::fs::write(fx.sync_dir.join("dir/leftover.txt"), b"x").unwrap();

        let doc = Metadata::new_folder("dir", ts());
        fx.side.delete_folder(&doc).await.unwrap();

        assert!(!fx.sync_dir.join("dir").exists());
        let trash = fx._dir.path().join("state/trash");
        assert_eq!(std::fs::read_dir(&trash).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_create_read_stream_reports_length() {
        let fx = fixture();
        std::fs::write(fx.sync_dir.join("a.txt"), b"hello").unwrap();
        let doc = Metadata::new_file("a.txt", digest::bytes_sha256(b"hello"), 5, ts());

        let stream = fx.side.create_read_stream(&doc).await.unwrap();
        assert_eq!(stream.length, 5);
        assert_eq!(stream.into_bytes().await.unwrap(), b"hello");
    }
}
