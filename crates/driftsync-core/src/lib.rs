//! driftsync-core: bidirectional file-synchronization engine.
//!
//! This crate provides the reconciliation triad keeping a local filesystem
//! tree and a remote document store consistent:
//! - The metadata ledger with its ordered change feed and global batch lock
//! - Merge, turning raw side events into consistent ledger writes
//! - The sync engine, replaying ledger changes onto whichever side is behind
//!
//! plus the side capability abstraction (with an in-memory double for tests),
//! conflict handling, ignore rules, and the event bus.

pub mod config;
pub mod conflict;
pub mod events;
pub mod ignore;
pub mod ledger;
pub mod merge;
pub mod metadata;
pub mod side;
pub mod sync;

pub use config::SyncConfig;
pub use conflict::{IdConflict, conflict_path, detect_id_conflict};
pub use events::{EventBus, Subscription, SyncEvent};
pub use ignore::Ignore;
pub use ledger::{Change, Ledger, LedgerError};
pub use merge::{Merge, MergeError};
pub use metadata::{DocType, Metadata, RemoteRef, SideName, SideRevs};
pub use side::{ContentStream, MemorySide, Side, SideError, SideOp, StreamSource};
pub use sync::{CorruptionSource, FileCorruption, SyncEngine, SyncError, SyncMode};
