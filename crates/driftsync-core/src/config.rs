//! Configuration for the sync engine.

use std::time::Duration;

/// Tunables of the change-application loop. The defaults preserve the
/// behavior the engine was validated with; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many times a document may fail to apply before it is abandoned
    /// at its cursor position.
    pub max_sync_attempts: u32,
    /// How often connectivity is probed while offline.
    pub offline_poll_interval: Duration,
    /// Grace period for a concurrently-trashing parent folder to reach the
    /// ledger before deciding a document must be trashed by itself.
    pub trash_parent_delay: Duration,
    /// Wait after trashing an ancestor so the change feed settles before the
    /// descendant's turn comes up again.
    pub trash_settle_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_sync_attempts: 3,
            offline_poll_interval: Duration::from_secs(60),
            trash_parent_delay: Duration::from_secs(1),
            trash_settle_delay: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        SyncConfig::default()
    }

    pub fn with_max_sync_attempts(mut self, attempts: u32) -> Self {
        self.max_sync_attempts = attempts;
        self
    }

    pub fn with_offline_poll_interval(mut self, interval: Duration) -> Self {
        self.offline_poll_interval = interval;
        self
    }

    pub fn with_trash_parent_delay(mut self, delay: Duration) -> Self {
        self.trash_parent_delay = delay;
        self
    }

    pub fn with_trash_settle_delay(mut self, delay: Duration) -> Self {
        self.trash_settle_delay = delay;
        self
    }
}
