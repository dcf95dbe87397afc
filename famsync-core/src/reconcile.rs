//! Pull-based reconciliation seam.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::ApplyError;
use crate::store::LocalStore;

/// How far the next pass's `since` is wound back from the local clock
/// reading taken when the previous pass started.
///
/// Server timestamps come from the server's clock; a device clock running
/// ahead of it would otherwise skip records modified in that gap. Re-pulling
/// the overlap is harmless because reconciliation only overwrites.
pub const RECONCILE_OVERLAP: Duration = Duration::minutes(5);

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub records_updated: usize,
}

/// Refreshes local records from the remote store, independent of the queue.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Pulls records changed since `since` (everything when `None`) into `store`.
    async fn reconcile(
        &self,
        store: &dyn LocalStore,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReconcileReport, ApplyError>;
}
