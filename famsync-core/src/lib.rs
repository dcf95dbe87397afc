//! Famsync Core Library
//!
//! Offline-first sync engine for the family app: a durable mutation queue,
//! connectivity monitoring, sync orchestration and conflict resolution.

pub mod applier;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod store;

pub use applier::{ApplierRegistry, ApplyMode, RemoteApplier};
pub use conflict::{ConflictResolver, FallbackPolicy};
pub use connectivity::{
    ConnectivityConfig, ConnectivityMonitor, ConnectivityState, MonitorHandle, ProbeError,
    ReachabilityProbe,
};
pub use engine::{
    EngineConfig, EngineHandle, EngineState, ItemOutcome, ItemResult, SyncEngine,
    SyncEngineBuilder, SyncResult,
};
pub use error::{ApplyError, StoreError, SyncError};
pub use events::SyncEvent;
pub use models::{
    ConflictResolution, ConflictStrategy, EntityType, Mutation, MutationStatus, Operation, Payload,
    StatusCounts, SyncStatistics,
};
pub use queue::MutationQueue;
pub use reconcile::{ReconcileReport, Reconciler, RECONCILE_OVERLAP};
pub use retry::RetryPolicy;
pub use store::{LocalStore, MemoryStore};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
