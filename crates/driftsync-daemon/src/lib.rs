//! driftsync-daemon: headless synchronization daemon.
//!
//! Wires the driftsync-core reconciliation engine to a real local directory
//! (tokio::fs) and a remote document store (HTTP), watches the directory for
//! changes, and polls the remote change feed.

pub mod digest;
pub mod local;
pub mod poller;
pub mod remote;
pub mod watcher;

pub use local::LocalSide;
pub use remote::RemoteSide;
