//! Replication counters

use parking_lot::Mutex;

/// Fault tolerance statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FtmStats {
    /// State bytes written to the framed stream (master)
    pub sent_state_bytes: u64,
    /// Dirty-page payload bytes sent (master)
    pub sent_memory_bytes: u64,
    /// State bytes read from the framed stream (standby)
    pub received_state_bytes: u64,
    /// Dirty-page payload bytes received (standby)
    pub received_memory_bytes: u64,
    /// Completed full syncs
    pub full_syncs: u64,
    /// Completed dirty-memory rounds
    pub memory_rounds: u64,
    /// Completed checkpoints
    pub checkpoints: u64,
    /// Rounds that ended in an error or NACK
    pub failed_rounds: u64,
    /// Connection attempts after the first
    pub reconnects: u64,
    /// Page ranges applied to standby memory
    pub pages_applied: u64,
    /// Page ranges the standby failed to apply
    pub page_apply_failures: u64,
}

/// Shared, lock-protected [`FtmStats`]
#[derive(Debug, Default)]
pub struct StatsCell(Mutex<FtmStats>);

impl StatsCell {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Update counters under the lock
    pub fn update(&self, f: impl FnOnce(&mut FtmStats)) {
        f(&mut self.0.lock());
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> FtmStats {
        self.0.lock().clone()
    }
}
