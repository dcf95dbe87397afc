//! Sync orchestrator.
//!
//! [`SyncEngine`] is the host-facing service object. It owns the mutation
//! queue and holds its collaborators (store, connectivity monitor, applier
//! registry, conflict resolver, optional reconciler), all injected at build
//! time. Cloning the engine is cheap and shares the same state.
//!
//! # States
//!
//! ```text
//! idle ──(connectivity up | timer | force_sync_now)──> draining ──> idle
//! idle ──(reconcile timer | long outage resolved)──> reconciling ──> idle
//! ```
//!
//! Only one run (drain or reconciliation) is active at a time. A trigger that
//! arrives while a run is active is coalesced into a no-op.

mod drain;
mod scheduler;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};

use crate::applier::ApplierRegistry;
use crate::conflict::ConflictResolver;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent, DEFAULT_EVENT_CAPACITY};
use crate::models::{
    ConflictStrategy, EntityType, Mutation, Operation, Payload, SyncStatistics,
};
use crate::queue::MutationQueue;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::retry::RetryPolicy;
use crate::store::LocalStore;

pub use scheduler::EngineHandle;

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mutations applied concurrently per batch.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Bound on each remote call; expiry counts as a transient failure.
    pub call_timeout: Duration,
    pub periodic_sync_interval: Duration,
    pub reconcile_interval: Duration,
    /// An outage at least this long triggers reconciliation once it ends.
    pub long_disconnect: Duration,
    /// How long completed and cancelled entries stay visible. `None` keeps them.
    pub completed_retention: Option<Duration>,
    /// Parked manual conflicts older than this resolve to the server copy.
    /// `None` parks them until resolved by hand.
    pub manual_conflict_expiry: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
            periodic_sync_interval: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(15 * 60),
            long_disconnect: Duration::from_secs(5 * 60),
            completed_retention: Some(Duration::from_secs(24 * 60 * 60)),
            manual_conflict_expiry: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// What the orchestrator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Draining,
    Reconciling,
}

/// Per-mutation outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Synced,
    Retrying {
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    Resolved {
        strategy: ConflictStrategy,
    },
    NeedsManualResolution,
}

impl ItemOutcome {
    /// Whether the item counts against the run's success.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::Retrying { .. } | ItemOutcome::Failed { .. } | ItemOutcome::NeedsManualResolution
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub mutation_id: String,
    pub entity_type: EntityType,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Aggregate result of one `force_sync_now` / scheduled run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    /// False if any item failed or the drain was cut short.
    pub success: bool,
    pub message: String,
    /// True when another run was already active and this trigger was dropped.
    pub coalesced: bool,
    pub items: Vec<ItemResult>,
}

impl SyncResult {
    fn coalesced() -> Self {
        Self {
            success: true,
            message: "sync already in progress".to_string(),
            coalesced: true,
            items: Vec::new(),
        }
    }

    fn skipped(message: String) -> Self {
        Self {
            success: false,
            message,
            coalesced: false,
            items: Vec::new(),
        }
    }

    pub fn synced(&self) -> usize {
        self.items
            .iter()
            .filter(|i| !i.outcome.is_failure())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_failure()).count()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    last_successful_sync_at: Option<DateTime<Utc>>,
    last_reconciled_at: Option<DateTime<Utc>>,
    /// `since` for the next reconciliation pass.
    reconcile_cursor: Option<DateTime<Utc>>,
}

struct EngineInner {
    queue: MutationQueue,
    store: Arc<dyn LocalStore>,
    monitor: Arc<ConnectivityMonitor>,
    registry: ApplierRegistry,
    resolver: ConflictResolver,
    reconciler: Option<Arc<dyn Reconciler>>,
    bus: EventBus,
    config: EngineConfig,
    run_lock: Mutex<()>,
    state_tx: watch::Sender<EngineState>,
    run_counter: AtomicU64,
    marks: Mutex<Marks>,
    /// Wakes the scheduling loop when new work arrives.
    wake: Notify,
}

/// Offline-first sync engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("connectivity", &self.inner.monitor.current_state())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

/// Collects collaborators for a [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: Arc<dyn LocalStore>,
    monitor: Arc<ConnectivityMonitor>,
    registry: ApplierRegistry,
    resolver: ConflictResolver,
    reconciler: Option<Arc<dyn Reconciler>>,
    config: EngineConfig,
}

impl SyncEngineBuilder {
    pub fn registry(mut self, registry: ApplierRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Opens the durable queue and assembles the engine.
    pub async fn build(self) -> Result<SyncEngine> {
        let queue = MutationQueue::open(Arc::clone(&self.store)).await?;
        let (state_tx, _) = watch::channel(EngineState::Idle);

        let engine = SyncEngine {
            inner: Arc::new(EngineInner {
                queue,
                store: self.store,
                monitor: self.monitor,
                registry: self.registry,
                resolver: self.resolver,
                reconciler: self.reconciler,
                bus: EventBus::new(self.config.event_capacity),
                config: self.config,
                run_lock: Mutex::new(()),
                state_tx,
                run_counter: AtomicU64::new(0),
                marks: Mutex::new(Marks::default()),
                wake: Notify::new(),
            }),
        };
        engine.publish_statistics().await;
        Ok(engine)
    }
}

impl SyncEngine {
    pub fn builder(store: Arc<dyn LocalStore>, monitor: Arc<ConnectivityMonitor>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            monitor,
            registry: ApplierRegistry::new(),
            resolver: ConflictResolver::default(),
            reconciler: None,
            config: EngineConfig::default(),
        }
    }

    /// Queues a local change. Always queued, even when online, so every write
    /// shares the same retry semantics.
    ///
    /// Fails with [`SyncError::UnknownEntityType`] when no applier can take
    /// the entity type.
    pub async fn enqueue_mutation(
        &self,
        entity_type: EntityType,
        operation: Operation,
        payload: Payload,
    ) -> Result<String> {
        if !self.inner.registry.contains(&entity_type) {
            return Err(SyncError::UnknownEntityType(entity_type));
        }

        let mutation = Mutation::new(entity_type.clone(), operation, payload, Utc::now())?;
        let id = self.inner.queue.enqueue(mutation).await?;

        tracing::debug!(mutation_id = %id, "Mutation enqueued");
        self.inner.bus.publish(SyncEvent::Queued {
            mutation_id: id.clone(),
            entity_type,
        });
        self.publish_statistics().await;
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Drains the queue now. Coalesced into a no-op if a run is active.
    pub async fn force_sync_now(&self) -> SyncResult {
        self.sync_all().await
    }

    /// Pulls remote state into the local store now.
    ///
    /// Returns `Ok(None)` when no reconciler is configured or another run is active.
    pub async fn reconcile_now(&self) -> Result<Option<ReconcileReport>> {
        let Some(reconciler) = self.inner.reconciler.clone() else {
            return Ok(None);
        };
        let Ok(_guard) = self.inner.run_lock.try_lock() else {
            return Ok(None);
        };
        self.reconcile_locked(reconciler.as_ref()).await.map(Some)
    }

    /// Supplies the final payload for a conflict parked for manual resolution.
    ///
    /// The payload becomes the local record immediately and is force-applied
    /// to the remote on the next drain.
    pub async fn resolve_manual_conflict(&self, mutation_id: &str, payload: Payload) -> Result<()> {
        let m = self.inner.queue.resolve_manual(mutation_id, payload).await?;
        self.write_local(&m.entity_type, &m.entity_id, &m.payload).await;

        tracing::info!(mutation_id = %mutation_id, "Manual conflict resolved");
        self.publish_statistics().await;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Settles a parked manual conflict by keeping the server's copy.
    ///
    /// The snapshot taken when the conflict was parked is written locally and
    /// the entry completes; nothing is sent to the remote.
    pub async fn resolve_manual_with_server(&self, mutation_id: &str) -> Result<()> {
        let m = self.inner.queue.resolve_manual_with_server(mutation_id).await?;
        self.write_local(&m.entity_type, &m.entity_id, &m.payload).await;

        tracing::info!(mutation_id = %mutation_id, "Manual conflict settled on server copy");
        self.publish_statistics().await;
        Ok(())
    }

    /// Cancels a queued mutation that is not in flight. Returns whether it was cancelled.
    pub async fn cancel_mutation(&self, mutation_id: &str) -> Result<bool> {
        let cancelled = self.inner.queue.cancel(mutation_id).await?;
        self.publish_statistics().await;
        Ok(cancelled)
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.queue.pending_count().await
    }

    pub async fn clear_failed(&self) -> Result<usize> {
        let removed = self.inner.queue.clear_failed().await;
        self.publish_statistics().await;
        removed
    }

    pub async fn clear_all(&self) -> Result<usize> {
        let removed = self.inner.queue.clear_all().await;
        self.publish_statistics().await;
        removed
    }

    pub async fn list_mutations(&self) -> Vec<Mutation> {
        self.inner.queue.list().await
    }

    pub async fn get_mutation(&self, mutation_id: &str) -> Option<Mutation> {
        self.inner.queue.get(mutation_id).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.bus.subscribe_events()
    }

    pub fn subscribe_statistics(&self) -> watch::Receiver<SyncStatistics> {
        self.inner.bus.subscribe_statistics()
    }

    /// Recomputes statistics from the queue.
    pub async fn statistics(&self) -> SyncStatistics {
        let counts = self.inner.queue.counts().await;
        let marks = *self.inner.marks.lock().await;
        SyncStatistics {
            counts,
            last_successful_sync_at: marks.last_successful_sync_at,
            last_reconciled_at: marks.last_reconciled_at,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.monitor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    async fn publish_statistics(&self) {
        let statistics = self.statistics().await;
        self.inner.bus.publish_statistics(statistics);
    }

    fn set_state(&self, state: EngineState) {
        self.inner.state_tx.send_replace(state);
    }

    /// Writes a settled record into the local store under its entity table.
    async fn write_local(&self, entity_type: &EntityType, entity_id: &str, payload: &Payload) {
        let record = serde_json::Value::Object(payload.clone());
        if let Err(e) = self
            .inner
            .store
            .put(entity_type.as_str(), entity_id, record)
            .await
        {
            tracing::warn!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                error = %e,
                "Failed to write resolved record locally"
            );
        }
    }
}
