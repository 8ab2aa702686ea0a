//! Remote change-feed polling.
//!
//! Periodically pulls the store's change feed from the last recorded remote
//! sequence and routes each entry into Merge, exactly like the filesystem
//! watcher does for local events. Move detection keys on the remote id: the
//! same id showing up under a new path is a move, not an add.

use crate::remote::{RemoteChangeDoc, RemoteSide};
use anyhow::Result;
use driftsync_core::ledger::Ledger;
use driftsync_core::merge::Merge;
use driftsync_core::metadata::{
    Metadata, RemoteRef, SideName, detect_platform_incompatibilities,
};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RemotePoller {
    remote: Arc<RemoteSide>,
    ledger: Arc<Ledger>,
    merge: Arc<Merge>,
}

impl RemotePoller {
    pub fn new(remote: Arc<RemoteSide>, ledger: Arc<Ledger>, merge: Arc<Merge>) -> Self {
        RemotePoller {
            remote,
            ledger,
            merge,
        }
    }

    /// Fetch and merge one page of remote changes. Returns how many entries
    /// were processed.
    pub async fn poll_once(&self) -> Result<usize> {
        let since = self.ledger.get_remote_seq().await;
        let (last_seq, changes) = self.remote.changes(since.as_deref()).await?;
        let count = changes.len();
        for change in changes {
            debug!(seq = %change.seq, path = %change.doc.path, "remote change");
            if let Err(err) = self.dispatch(&change.doc).await {
                warn!(path = %change.doc.path, %err, "failed to merge remote change");
            }
        }
        self.ledger.set_remote_seq(last_seq).await;
        Ok(count)
    }

    /// Route one remote document into the matching Merge operation.
    pub async fn dispatch(&self, doc: &RemoteChangeDoc) -> driftsync_core::merge::Result<()> {
        let was = self.ledger.by_remote_id_maybe(&doc.id).await;
        let is_folder = doc.kind != "file";

        if doc.deleted {
            let Some(was) = was else { return Ok(()) };
            return if was.is_folder() {
                self.merge.delete_folder(SideName::Remote, &was).await
            } else {
                self.merge.delete_file(SideName::Remote, &was).await
            };
        }

        let mut incoming = if is_folder {
            Metadata::new_folder(&doc.path, doc.updated_at)
        } else {
            Metadata::new_file(&doc.path, "", 0, doc.updated_at)
        };
        incoming.checksum = doc.checksum.clone();
        incoming.size = doc.size;
        incoming.executable = doc.executable;
        incoming.remote = Some(RemoteRef {
            id: doc.id.clone(),
            rev: doc.rev,
        });
        incoming.incompatibilities = detect_platform_incompatibilities(&incoming.path);

        if doc.trashed {
            let Some(was) = was else { return Ok(()) };
            incoming.trashed = true;
            return if is_folder {
                self.merge.trash_folder(SideName::Remote, &was, &incoming).await
            } else {
                self.merge.trash_file(SideName::Remote, &was, &incoming).await
            };
        }

        match was {
            Some(was) if was.path != incoming.path => {
                if is_folder {
                    self.merge.move_folder(SideName::Remote, &incoming, &was).await
                } else {
                    self.merge.move_file(SideName::Remote, &incoming, &was).await
                }
            }
            Some(_) if is_folder => self.merge.put_folder(SideName::Remote, &incoming).await,
            Some(_) => self.merge.update_file(SideName::Remote, &incoming).await,
            None if is_folder => self.merge.put_folder(SideName::Remote, &incoming).await,
            None => {
                if self.ledger.get_maybe(&incoming.id).await.is_some() {
                    self.merge.update_file(SideName::Remote, &incoming).await
                } else {
                    self.merge.add_file(SideName::Remote, &incoming).await
                }
            }
        }
    }
}
