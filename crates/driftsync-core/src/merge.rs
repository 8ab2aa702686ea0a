//! Merge: turns a side's observed change into the minimal set of ledger
//! writes that make the ledger consistent with reality, while preserving the
//! other side's pending, not-yet-applied changes.
//!
//! Every operation re-reads current ledger state first, so re-invoking a call
//! on the same input is safe. Merge never retries internally: it either
//! completes the ledger write or returns an error, and the watchers re-run
//! their detection cycle.

use crate::conflict::{conflict_path, detect_id_conflict};
use crate::ledger::{Ledger, LedgerError};
use crate::metadata::{
    self, DocType, Metadata, SideName, assign_max_date, detect_platform_incompatibilities,
    dissociate, is_up_to_date, mark_side, parent_id, parent_path, same_binary, same_file,
    same_folder,
};
use crate::side::{Side, SideError};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Side(#[from] SideError),

    #[error("cannot resolve a file/folder conflict at {0}")]
    UnresolvableConflict(String),
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// Translates side events into ledger writes.
pub struct Merge {
    ledger: Arc<Ledger>,
    local: Arc<dyn Side>,
    remote: Arc<dyn Side>,
}

impl Merge {
    pub fn new(ledger: Arc<Ledger>, local: Arc<dyn Side>, remote: Arc<dyn Side>) -> Self {
        Merge {
            ledger,
            local,
            remote,
        }
    }

    fn side(&self, name: SideName) -> &Arc<dyn Side> {
        match name {
            SideName::Local => &self.local,
            SideName::Remote => &self.remote,
        }
    }

    /* Helpers */

    /// Make sure the tree structure above `doc` exists in the ledger,
    /// creating placeholder folders top-down where it does not.
    pub async fn ensure_parent_exists(&self, side: SideName, doc: &Metadata) -> Result<()> {
        trace!(path = %doc.path, "ensure_parent_exists");
        let (Some(pid), Some(ppath)) = (parent_id(&doc.id), parent_path(&doc.path)) else {
            return Ok(());
        };
        if self.ledger.get_maybe(pid).await.is_some() {
            return Ok(());
        }
        let parent = Metadata::new_folder(ppath, Utc::now());
        Box::pin(self.ensure_parent_exists(side, &parent)).await?;
        Box::pin(self.put_folder(side, &parent)).await?;
        Ok(())
    }

    /// Resolve a conflict by renaming a file/folder on the originating side.
    ///
    /// Returns the adjusted document for the caller to persist or discard.
    pub async fn resolve_conflict(&self, side: SideName, doc: &Metadata) -> Result<Metadata> {
        let new_path = conflict_path(&doc.path, Utc::now());
        warn!(path = %doc.path, new_path = %new_path, "resolving conflict with a rename");
        self.side(side).rename_conflicting_doc(doc, &new_path).await?;
        let mut dst = doc.clone();
        dst.id = metadata::id_from_path(&new_path);
        dst.path = new_path;
        Ok(dst)
    }

    /* Actions */

    /// Add a file, if it doesn't already exist, and create the tree
    /// structure if needed.
    pub async fn add_file(&self, side: SideName, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, %side, "add_file");
        let existing = self.ledger.get_maybe(&doc.id).await;
        let mut doc = doc.clone();
        mark_side(side, &mut doc, existing.as_ref());
        if let Some(id_conflict) = detect_id_conflict(side, &doc, existing.as_ref()) {
            warn!(%id_conflict, "identity conflict");
            self.resolve_conflict(side, &doc).await?;
            return Ok(());
        }
        if let Some(file) = &existing {
            if file.doc_type == DocType::Folder {
                self.resolve_conflict(side, &doc).await?;
                return Ok(());
            }
        }
        assign_max_date(&mut doc, existing.as_ref());
        if let Some(file) = existing {
            if same_binary(&file, &doc) {
                doc.rev = file.rev;
                if doc.size.is_none() {
                    doc.size = file.size;
                }
                if doc.class.is_none() {
                    doc.class = file.class.clone();
                }
                if doc.mime.is_none() {
                    doc.mime = file.mime.clone();
                }
                if doc.tags.is_empty() {
                    doc.tags = file.tags.clone();
                }
                if doc.remote.is_none() {
                    doc.remote = file.remote.clone();
                }
                if doc.ino.is_none() {
                    doc.ino = file.ino;
                }
                if same_file(&file, &doc) {
                    info!(path = %doc.path, "up to date");
                    return Ok(());
                }
                self.ledger.put(doc).await?;
                return Ok(());
            }
            if side == SideName::Local && file.sides.get(SideName::Local).is_some() {
                return self.resolve_initial_add(side, doc, file).await;
            }
            self.resolve_conflict(side, &doc).await?;
            return Ok(());
        }
        self.ensure_parent_exists(side, &doc).await?;
        self.ledger.put(doc).await?;
        Ok(())
    }

    /// A file modified while the engine was not running is re-detected as a
    /// new file at startup; figure out what actually happened.
    async fn resolve_initial_add(
        &self,
        side: SideName,
        mut doc: Metadata,
        file: Metadata,
    ) -> Result<()> {
        let local = file.sides.get(SideName::Local);
        let remote = file.sides.get(SideName::Remote);
        if remote.is_none() || remote == local {
            // Updated on local before being pushed, or after being synced.
            return self.update_file(side, &doc).await;
        }
        // Updated on remote, and maybe on local too.
        let short_rev = local.unwrap_or(0);
        if let Ok(prev) = self.ledger.get_previous_rev(&doc.id, short_rev).await {
            if prev.checksum == doc.checksum {
                // Only updated on remote.
                return Ok(());
            }
        }
        // It's safer to handle it as a conflict.
        if doc.remote.is_none() {
            doc.remote = file.remote.clone();
        }
        self.resolve_conflict(SideName::Remote, &doc).await?;
        Ok(())
    }

    /// Update a file, when its metadata or its content has changed.
    pub async fn update_file(&self, side: SideName, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, %side, "update_file");
        let existing = self.ledger.get_maybe(&doc.id).await;
        let mut doc = doc.clone();
        mark_side(side, &mut doc, existing.as_ref());
        if let Some(file) = &existing {
            if file.doc_type == DocType::Folder {
                return Err(MergeError::UnresolvableConflict(doc.path.clone()));
            }
        }
        assign_max_date(&mut doc, existing.as_ref());
        if let Some(file) = existing {
            doc.rev = file.rev;
            doc.move_from = file.move_from.clone();
            if doc.tags.is_empty() {
                doc.tags = file.tags.clone();
            }
            if doc.remote.is_none() {
                doc.remote = file.remote.clone();
            }
            if doc.ino.is_none() {
                doc.ino = file.ino;
            }
            if same_binary(&file, &doc) {
                if doc.size.is_none() {
                    doc.size = file.size;
                }
                if doc.class.is_none() {
                    doc.class = file.class.clone();
                }
                if doc.mime.is_none() {
                    doc.mime = file.mime.clone();
                }
            } else if !is_up_to_date(side, &file) {
                // The other side has a pending change to this content.
                self.resolve_conflict(side, &doc).await?;
                return Ok(());
            }
            if same_file(&file, &doc) {
                info!(path = %doc.path, "up to date");
                return Ok(());
            }
            self.ledger.put(doc).await?;
            return Ok(());
        }
        self.ensure_parent_exists(side, &doc).await?;
        self.ledger.put(doc).await?;
        Ok(())
    }

    /// Create or update a folder.
    pub async fn put_folder(&self, side: SideName, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, %side, "put_folder");
        let existing = self.ledger.get_maybe(&doc.id).await;
        let mut doc = doc.clone();
        mark_side(side, &mut doc, existing.as_ref());
        if let Some(folder) = &existing {
            if folder.doc_type == DocType::File {
                self.resolve_conflict(side, &doc).await?;
                return Ok(());
            }
        }
        assign_max_date(&mut doc, existing.as_ref());
        if let Some(id_conflict) = detect_id_conflict(side, &doc, existing.as_ref()) {
            warn!(%id_conflict, "identity conflict");
            self.resolve_conflict(side, &doc).await?;
            return Ok(());
        }
        if let Some(folder) = existing {
            doc.rev = folder.rev;
            if doc.tags.is_empty() {
                doc.tags = folder.tags.clone();
            }
            if doc.remote.is_none() {
                doc.remote = folder.remote.clone();
            }
            if doc.ino.is_none() {
                doc.ino = folder.ino;
            }
            if same_folder(&folder, &doc) {
                info!(path = %doc.path, "up to date");
                return Ok(());
            }
            self.ledger.put(doc).await?;
            return Ok(());
        }
        self.ensure_parent_exists(side, &doc).await?;
        self.ledger.put(doc).await?;
        Ok(())
    }

    /// Rename or move a file.
    pub async fn move_file(&self, side: SideName, doc: &Metadata, was: &Metadata) -> Result<()> {
        debug!(path = %doc.path, oldpath = %was.path, %side, "move_file");
        if was.sides.get(side).is_none() {
            // The move source was never seen by this side; this happens after
            // a conflict rename redirected the events.
            return self.add_file(side, doc).await;
        }
        let existing = self.ledger.get_maybe(&doc.id).await;
        if let Some(id_conflict) = detect_id_conflict(side, doc, existing.as_ref()) {
            warn!(%id_conflict, "identity conflict");
            self.resolve_conflict(side, doc).await?;
            return Ok(());
        }
        let mut doc = doc.clone();
        let mut was = was.clone();
        mark_side(side, &mut doc, existing.as_ref());
        let was_prev = was.clone();
        mark_side(side, &mut was, Some(&was_prev));
        assign_max_date(&mut doc, Some(&was));
        if doc.size.is_none() {
            doc.size = was.size;
        }
        if doc.class.is_none() {
            doc.class = was.class.clone();
        }
        if doc.mime.is_none() {
            doc.mime = was.mime.clone();
        }
        if doc.tags.is_empty() {
            doc.tags = was.tags.clone();
        }
        if doc.ino.is_none() {
            doc.ino = was.ino;
        }
        was.move_to = Some(doc.id.clone());
        was.deleted = true;
        doc.move_from = Some(Box::new(was.clone()));

        if let Some(file) = &existing {
            if same_file(file, &doc) {
                info!(path = %doc.path, "up to date (move)");
                return Ok(());
            }
        }
        match existing {
            Some(file) if doc.overwrite.is_none() && doc.path == file.path => {
                // Destination occupied by an unrelated document: rename the
                // moved entry out of the way and re-link the move onto it.
                let mut dst = self.resolve_conflict(side, &doc).await?;
                was.move_to = Some(dst.id.clone());
                dst.sides = Default::default();
                dst.sides.set(side, 1);
                dst.move_from = Some(Box::new(was.clone()));
                dst.rev = 0;
                for result in self.ledger.bulk_docs(vec![was, dst]).await {
                    result?;
                }
                Ok(())
            }
            other => {
                if let Some(file) = other {
                    if doc.overwrite.is_some() {
                        doc.overwrite = Some(Box::new(file.clone()));
                        doc.rev = file.rev;
                    }
                }
                self.ensure_parent_exists(side, &doc).await?;
                for result in self.ledger.bulk_docs(vec![was, doc]).await {
                    result?;
                }
                Ok(())
            }
        }
    }

    /// Rename or move a folder, and everything inside it.
    pub async fn move_folder(&self, side: SideName, doc: &Metadata, was: &Metadata) -> Result<()> {
        debug!(path = %doc.path, oldpath = %was.path, %side, "move_folder");
        if was.sides.get(side).is_none() {
            // It can happen after a conflict.
            return self.put_folder(side, doc).await;
        }
        let existing = self.ledger.get_maybe(&doc.id).await;
        let mut doc = doc.clone();
        let mut was = was.clone();
        mark_side(side, &mut doc, existing.as_ref());
        let was_prev = was.clone();
        mark_side(side, &mut was, Some(&was_prev));
        assign_max_date(&mut doc, Some(&was));
        if doc.tags.is_empty() {
            doc.tags = was.tags.clone();
        }
        if doc.ino.is_none() {
            doc.ino = was.ino;
        }
        if let Some(id_conflict) = detect_id_conflict(side, &doc, existing.as_ref()) {
            warn!(%id_conflict, "identity conflict");
            self.resolve_conflict(side, &doc).await?;
            return Ok(());
        }
        if let Some(folder) = &existing {
            if doc.overwrite.is_none() && doc.path == folder.path {
                let mut dst = self.resolve_conflict(side, &doc).await?;
                dst.sides = Default::default();
                dst.sides.set(side, 1);
                dst.rev = 0;
                return self.move_folder_recursively(side, dst, was).await;
            }
        }
        if let Some(folder) = existing {
            if doc.overwrite.is_some() {
                doc.overwrite = Some(Box::new(folder.clone()));
                doc.rev = folder.rev;
            }
        }
        self.ensure_parent_exists(side, &doc).await?;
        self.move_folder_recursively(side, doc, was).await
    }

    /// Move a folder and all the things inside it, in one bulk write.
    async fn move_folder_recursively(
        &self,
        side: SideName,
        mut folder: Metadata,
        mut was: Metadata,
    ) -> Result<()> {
        let children = self.ledger.by_recursive_path(&was.id).await;
        was.move_to = Some(folder.id.clone());
        was.deleted = true;
        folder.move_from = Some(Box::new(was.clone()));

        let mut bulk = vec![was.clone(), folder.clone()];
        for child in children {
            let mut src = child.clone();
            let mut dst = child.clone();
            dst.id = format!("{}{}", folder.id, &child.id[was.id.len()..]);
            dst.path = format!("{}{}", folder.path, &child.path[was.path.len()..]);
            src.move_to = Some(dst.id.clone());
            src.deleted = true;
            dst.child_move = true;
            dst.rev = 0;
            dst.move_from = Some(Box::new(src.clone()));
            mark_side(side, &mut dst, Some(&child));
            dst.incompatibilities = detect_platform_incompatibilities(&dst.path);
            bulk.push(src);
            bulk.push(dst);
        }
        for result in self.ledger.bulk_docs(bulk).await {
            result?;
        }
        Ok(())
    }

    /// Bring a trashed file back at its restored location.
    pub async fn restore_file(&self, side: SideName, was: &Metadata, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, oldpath = %was.path, "restore_file");
        if let Err(err) = self.delete_file(side, was).await {
            warn!(path = %was.path, %err, "could not drop the trashed version");
        }
        self.update_file(side, doc).await
    }

    /// Bring a trashed folder back at its restored location.
    pub async fn restore_folder(
        &self,
        side: SideName,
        was: &Metadata,
        doc: &Metadata,
    ) -> Result<()> {
        debug!(path = %doc.path, oldpath = %was.path, "restore_folder");
        if let Err(err) = self.delete_folder(side, was).await {
            warn!(path = %was.path, %err, "could not drop the trashed version");
        }
        self.put_folder(side, doc).await
    }

    async fn do_trash(&self, side: SideName, was: &Metadata, doc: &Metadata) -> Result<()> {
        let Some(old) = self.ledger.get_maybe(&was.id).await else {
            debug!(path = %doc.path, "nothing to trash");
            return Ok(());
        };
        if doc.doc_type != old.doc_type {
            self.resolve_conflict(side, doc).await?;
            return Ok(());
        }
        if side == SideName::Remote && doc.doc_type == DocType::File && !same_binary(&old, doc) {
            // The file was updated locally and trashed remotely: dissociate
            // the remote so the local update wins.
            let mut old = old;
            dissociate(&mut old, SideName::Remote);
            self.ledger.put(old).await?;
            return Ok(());
        }
        let mut old = old;
        old.errors = 0;
        let mut trashed = old.clone();
        mark_side(side, &mut trashed, Some(&old));
        trashed.trashed = true;
        if old.sides.get(side).is_some() {
            let old_prev = old.clone();
            mark_side(side, &mut old, Some(&old_prev));
            old.deleted = true;
            match self.ledger.put(old).await {
                Ok(_) => return Ok(()),
                Err(err) => warn!(path = %doc.path, %err, "tombstone write lost a race"),
            }
        }
        self.ledger.put(trashed).await?;
        Ok(())
    }

    /// Soft-delete a file.
    pub async fn trash_file(&self, side: SideName, was: &Metadata, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, oldpath = %was.path, "trash_file");
        self.do_trash(side, was, doc).await
    }

    /// Soft-delete a folder, unless the other side has newer content in it.
    pub async fn trash_folder(&self, side: SideName, was: &Metadata, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, oldpath = %was.path, "trash_folder");
        let mut children = self.ledger.by_recursive_path(&was.id).await;
        children.reverse();
        for child in &children {
            if child.doc_type == DocType::File && !is_up_to_date(side, child) {
                // A file inside was added or updated on the other side: abort
                // the trash and hand the folder over as a fresh put.
                let mut was = was.clone();
                was.trashed = false;
                was.errors = 0;
                was.sides.clear(side);
                if was.sides.is_empty() {
                    was.sides.set(side.other(), 1);
                }
                return self.put_folder(side.other(), &was).await;
            }
        }
        for child in &children {
            if child.doc_type == DocType::Folder {
                let mut child = child.clone();
                child.deleted = true;
                if let Err(err) = self.ledger.put(child.clone()).await {
                    warn!(path = %child.path, %err, "failed to tombstone sub-folder");
                }
            }
        }
        self.do_trash(side, was, doc).await
    }

    /// Remove a file from the ledger.
    ///
    /// Watchers often detect the deletion of a folder before the deletion of
    /// the files inside it, so a deletion for an id that is already gone is
    /// not an error.
    pub async fn delete_file(&self, side: SideName, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, %side, "delete_file");
        let Some(mut file) = self.ledger.get_maybe(&doc.id).await else {
            return Ok(());
        };
        if file.sides.get(side).is_none() {
            // It can happen after a conflict.
            return Ok(());
        }
        let prev = file.clone();
        mark_side(side, &mut file, Some(&prev));
        file.deleted = true;
        file.errors = 0;
        self.ledger.put(file).await?;
        Ok(())
    }

    /// Remove a folder and everything inside it, preserving anything the
    /// other side still has pending changes for.
    pub async fn delete_folder(&self, side: SideName, doc: &Metadata) -> Result<()> {
        debug!(path = %doc.path, %side, "delete_folder");
        let Some(folder) = self.ledger.get_maybe(&doc.id).await else {
            return Ok(());
        };
        if folder.sides.get(side).is_none() {
            // It can happen after a conflict.
            return Ok(());
        }
        self.delete_folder_recursively(side, folder).await
    }

    async fn delete_folder_recursively(&self, side: SideName, folder: Metadata) -> Result<()> {
        let mut docs = self.ledger.by_recursive_path(&folder.id).await;
        // In the change feed, nested entries must be deleted before their
        // parents, hence the reverse order.
        docs.reverse();
        docs.push(folder.clone());
        let mut to_preserve: HashSet<String> = HashSet::new();
        let mut bulk = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if to_preserve.contains(&doc.path)
                || (!doc.sides.is_empty() && !is_up_to_date(side, &doc))
            {
                warn!(
                    path = %doc.path,
                    folder = %folder.path,
                    "cannot be deleted with its folder: modified on the {} side",
                    side.other()
                );
                info!(path = %doc.path, "dissociating from {}", side);
                dissociate(&mut doc, side);
                if let Some(parent) = parent_path(&doc.path) {
                    to_preserve.insert(parent.to_string());
                }
            } else {
                let prev = doc.clone();
                mark_side(side, &mut doc, Some(&prev));
                doc.deleted = true;
                doc.errors = 0;
            }
            bulk.push(doc);
        }
        for result in self.ledger.bulk_docs(bulk).await {
            result?;
        }
        Ok(())
    }
}
