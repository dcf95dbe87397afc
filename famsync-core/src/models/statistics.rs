use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counts of queued mutations by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Subset of `failed` parked for manual conflict resolution.
    pub needs_manual_resolution: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Read model over the mutation queue. Always recomputed, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub counts: StatusCounts,
    /// End of the last run in which every attempted mutation succeeded.
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}
