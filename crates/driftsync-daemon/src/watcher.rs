//! Filesystem watcher with debouncing for the synchronized directory.
//!
//! Uses notify-debouncer-mini for efficient change detection. Events carry
//! paths relative to the synchronized directory; the state directory and
//! hidden entries never produce events.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Directory holding the ledger snapshot, temp downloads and the trash area.
pub const STATE_DIR_NAME: &str = ".driftsync";

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path relative to the synchronized directory.
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// Entry was created or modified.
    Modified,
    /// Entry was deleted.
    Deleted,
}

/// Watches the synchronized directory for changes.
pub struct SyncDirWatcher {
    sync_dir: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl SyncDirWatcher {
    /// Watch `sync_dir` recursively with a 200ms debounce period.
    pub fn new(sync_dir: PathBuf) -> Result<Self> {
        // Resolve symlinks; some platforms report events under the real path.
        let sync_dir = sync_dir.canonicalize().unwrap_or(sync_dir);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watched = sync_dir.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event, &watched) {
                            if event_tx.send(file_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    error!("watcher error: {err}");
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&sync_dir, RecursiveMode::Recursive)?;

        Ok(SyncDirWatcher {
            sync_dir,
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(event: &DebouncedEvent, sync_dir: &Path) -> Option<FileEvent> {
        let relative = event.path.strip_prefix(sync_dir).ok()?;
        let relative = relative.to_str()?;
        if relative.is_empty() {
            return None;
        }

        // Skip the state directory and hidden entries.
        if relative
            .split('/')
            .any(|name| name == STATE_DIR_NAME || name.starts_with('.'))
        {
            return None;
        }

        let kind = if event.path.exists() {
            FileEventKind::Modified
        } else {
            FileEventKind::Deleted
        };
        debug!("file event: {kind:?} - {relative}");

        Some(FileEvent {
            path: relative.to_string(),
            kind,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn sync_dir(&self) -> &Path {
        &self.sync_dir
    }
}
