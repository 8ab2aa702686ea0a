//! driftsync-daemon: keeps a local directory and a remote document store in
//! sync.
//!
//! The daemon wires the core reconciliation engine to its two sides, feeds
//! Merge from the filesystem watcher and the remote change-feed poller, and
//! snapshots the ledger periodically and on shutdown.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use driftsync_daemon::poller::RemotePoller;
use driftsync_daemon::watcher::{FileEvent, FileEventKind, STATE_DIR_NAME, SyncDirWatcher};
use driftsync_daemon::{LocalSide, RemoteSide, digest};

use driftsync_core::events::EventBus;
use driftsync_core::ledger::Ledger;
use driftsync_core::merge::Merge;
use driftsync_core::metadata::{self, Metadata, SideName};
use driftsync_core::sync::{SyncEngine, SyncMode};
use driftsync_core::{Ignore, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "driftsync-daemon")]
#[command(about = "Bidirectional file synchronization daemon")]
struct Args {
    /// Path to the synchronized directory
    #[arg(short, long)]
    sync_dir: PathBuf,

    /// Base URL of the remote document store
    #[arg(long)]
    remote_url: String,

    /// Bearer token for the remote store
    #[arg(long, env = "DRIFTSYNC_TOKEN")]
    token: Option<String>,

    /// Which direction(s) to synchronize
    #[arg(long, value_enum, default_value_t = ModeArg::Full)]
    mode: ModeArg,

    /// Extra ignore patterns (a component name or a path prefix)
    #[arg(long)]
    ignore: Vec<String>,

    /// How often to poll the remote change feed, in seconds
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Only apply remote changes to the filesystem
    Pull,
    /// Only apply filesystem changes to the remote store
    Push,
    /// Synchronize both directions
    Full,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> SyncMode {
        match mode {
            ModeArg::Pull => SyncMode::Pull,
            ModeArg::Push => SyncMode::Push,
            ModeArg::Full => SyncMode::Full,
        }
    }
}

/// Daemon state shared by the event handlers.
struct Daemon {
    sync_dir: PathBuf,
    ledger: Arc<Ledger>,
    merge: Arc<Merge>,
}

impl Daemon {
    async fn on_file_event(&self, event: FileEvent) {
        match event.kind {
            FileEventKind::Modified => self.on_modified(&event.path, false).await,
            FileEventKind::Deleted => self.on_deleted(&event.path).await,
        }
    }

    /// `initial` marks the startup scan: everything found is reported as an
    /// add, and Merge itself recognizes what changed while the daemon was
    /// down.
    async fn on_modified(&self, path: &str, initial: bool) {
        let full = self.sync_dir.join(path);
        let meta = match fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path, %err, "entry vanished before it could be read");
                return;
            }
        };
        let updated_at = meta
            .modified()
            .map(chrono::DateTime::from)
            .unwrap_or_else(|_| chrono::Utc::now());

        let result = if meta.is_dir() {
            let mut doc = Metadata::new_folder(path, updated_at);
            doc.ino = ino(&meta);
            doc.incompatibilities = metadata::detect_platform_incompatibilities(path);
            self.merge.put_folder(SideName::Local, &doc).await
        } else {
            let checksum = match digest::file_sha256(&full).await {
                Ok(checksum) => checksum,
                Err(err) => {
                    warn!(path, %err, "could not checksum file");
                    return;
                }
            };
            let mut doc = Metadata::new_file(path, checksum, meta.len(), updated_at);
            doc.executable = is_executable(&meta);
            doc.ino = ino(&meta);
            doc.incompatibilities = metadata::detect_platform_incompatibilities(path);
            if !initial && self.ledger.get_maybe(&doc.id).await.is_some() {
                self.merge.update_file(SideName::Local, &doc).await
            } else {
                self.merge.add_file(SideName::Local, &doc).await
            }
        };
        if let Err(err) = result {
            error!(path, %err, "failed to merge local change");
        }
    }

    async fn on_deleted(&self, path: &str) {
        let id = metadata::id_from_path(path);
        let Some(doc) = self.ledger.get_maybe(&id).await else {
            return;
        };
        let result = if doc.is_folder() {
            self.merge.delete_folder(SideName::Local, &doc).await
        } else {
            self.merge.delete_file(SideName::Local, &doc).await
        };
        if let Err(err) = result {
            error!(path, %err, "failed to merge local deletion");
        }
    }

    /// Walk the tree once at startup so changes made while the daemon was
    /// down are re-detected.
    async fn initial_scan(&self) {
        let mut stack = vec![self.sync_dir.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %dir.display(), %err, "could not scan directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name == STATE_DIR_NAME || name.starts_with('.') {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&self.sync_dir).map(PathBuf::from)
                else {
                    continue;
                };
                let Some(relative) = relative.to_str().map(String::from) else {
                    continue;
                };
                self.on_modified(&relative, true).await;
                if entry.path().is_dir() {
                    stack.push(entry.path());
                }
            }
        }
    }
}

fn ino(meta: &std::fs::Metadata) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(meta.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        None
    }
}

fn is_executable(meta: &std::fs::Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        false
    }
}

async fn recv_watch(watcher: &mut Option<SyncDirWatcher>) -> Option<FileEvent> {
    match watcher {
        Some(watcher) => watcher.event_rx().recv().await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "debug,driftsync_daemon=debug"
    } else {
        "info,driftsync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting driftsync-daemon");
    info!("sync dir: {:?}", args.sync_dir);
    info!("remote: {}", args.remote_url);

    let state_dir = args.sync_dir.join(STATE_DIR_NAME);
    let ledger_path = state_dir.join("ledger.json");
    let ledger = Arc::new(Ledger::load(&ledger_path)?);
    let events = Arc::new(EventBus::new());

    let local = Arc::new(LocalSide::new(
        args.sync_dir.clone(),
        state_dir.clone(),
        Arc::clone(&ledger),
        Arc::clone(&events),
    ));
    let remote = Arc::new(RemoteSide::new(&args.remote_url, args.token.clone()));
    let merge = Arc::new(Merge::new(
        Arc::clone(&ledger),
        local.clone(),
        remote.clone(),
    ));

    let engine = Arc::new(
        SyncEngine::new(
            Arc::clone(&ledger),
            local.clone(),
            remote.clone(),
            Ignore::new(args.ignore.clone()),
            Arc::clone(&events),
            SyncConfig::default(),
        )
        .with_corruption_source(remote.clone()),
    );

    let daemon = Daemon {
        sync_dir: args.sync_dir.clone(),
        ledger: Arc::clone(&ledger),
        merge: Arc::clone(&merge),
    };

    let mut watcher = if args.mode != ModeArg::Pull {
        daemon.initial_scan().await;
        Some(SyncDirWatcher::new(args.sync_dir.clone())?)
    } else {
        None
    };
    if watcher.is_some() {
        info!("file watcher started");
    }

    let poller = (args.mode != ModeArg::Push)
        .then(|| RemotePoller::new(remote.clone(), Arc::clone(&ledger), Arc::clone(&merge)));

    let mut engine_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        let mode: SyncMode = args.mode.into();
        async move { engine.start(mode).await }
    });

    let mut poll_timer = tokio::time::interval(Duration::from_secs(args.poll_interval.max(1)));
    let mut snapshot_timer = tokio::time::interval(Duration::from_secs(30));
    let mut engine_done = false;

    info!("daemon running, press Ctrl+C to stop");
    loop {
        tokio::select! {
            Some(event) = recv_watch(&mut watcher) => {
                daemon.on_file_event(event).await;
            }

            _ = poll_timer.tick(), if poller.is_some() => {
                if let Some(poller) = &poller {
                    match poller.poll_once().await {
                        Ok(count) if count > 0 => debug!(count, "merged remote changes"),
                        Ok(_) => {}
                        Err(err) => warn!(%err, "remote poll failed"),
                    }
                }
            }

            _ = snapshot_timer.tick() => {
                ledger.compact().await;
                if let Err(err) = ledger.save(&ledger_path) {
                    warn!(%err, "could not snapshot the ledger");
                }
            }

            result = &mut engine_task => {
                match result {
                    Ok(Ok(())) => info!("sync loop finished"),
                    Ok(Err(err)) => error!(%err, "sync loop aborted"),
                    Err(err) => error!(%err, "sync task failed"),
                }
                engine_done = true;
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                engine.stop();
                break;
            }
        }
    }

    if !engine_done {
        let _ = engine_task.await;
    }
    if let Err(err) = ledger.save(&ledger_path) {
        warn!(%err, "could not write the final ledger snapshot");
    }
    info!("shutting down");
    Ok(())
}
