//! One orchestrator run: drain the queue in bounded concurrent batches and
//! route each outcome to completion, retry, conflict resolution or permanent
//! failure.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use tokio::time::timeout;

use super::{EngineState, ItemOutcome, ItemResult, SyncEngine, SyncResult};
use crate::applier::{ApplyMode, RemoteApplier};
use crate::conflict::FallbackPolicy;
use crate::connectivity::ConnectivityState;
use crate::error::{ApplyError, Result, StoreError, SyncError};
use crate::events::SyncEvent;
use crate::models::{ConflictResolution, ConflictStrategy, Mutation, MutationStatus, Payload};
use crate::reconcile::{ReconcileReport, Reconciler, RECONCILE_OVERLAP};
use crate::store::{LocalStore, RecordFilter};

impl SyncEngine {
    pub(super) async fn sync_all(&self) -> SyncResult {
        let Ok(_guard) = self.inner.run_lock.try_lock() else {
            tracing::debug!("Sync trigger coalesced into active run");
            return SyncResult::coalesced();
        };

        let connectivity = self.inner.monitor.current_state();
        if !connectivity.allows_sync() {
            let pending = self.inner.queue.pending_count().await;
            return SyncResult::skipped(format!(
                "not syncing while {}: {} mutation(s) pending",
                connectivity, pending
            ));
        }

        if self.inner.queue.is_diverged().await {
            tracing::warn!("Queue diverged from durable state, reloading");
            if let Err(e) = self.inner.queue.reload().await {
                return SyncResult::skipped(format!("failed to reload queue: {}", e));
            }
        }

        let run_id = self.inner.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(EngineState::Draining);
        let pending = self.inner.queue.pending_count().await;
        tracing::info!(run_id, pending, connectivity = %connectivity, "Sync started");
        self.inner.bus.publish(SyncEvent::Started { run_id, pending });

        let mut items = self.expire_manual_conflicts(run_id).await;
        let mut interrupted = None;

        loop {
            if self.inner.monitor.current_state() == ConnectivityState::Disconnected {
                interrupted = Some("connectivity lost during sync".to_string());
                break;
            }

            let batch = match self.inner.queue.dequeue_batch(self.inner.config.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    interrupted = Some(format!("queue error: {}", e));
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            tracing::debug!(run_id, size = batch.len(), "Applying batch");
            let results = join_all(batch.into_iter().map(|m| self.process(run_id, m))).await;
            items.extend(results);
        }

        self.prune_finished().await;

        let synced = items.iter().filter(|i| !i.outcome.is_failure()).count();
        let failed = items.len() - synced;
        let success = interrupted.is_none() && failed == 0;

        let message = match &interrupted {
            Some(reason) => format!("{} ({} synced, {} failed)", reason, synced, failed),
            None if failed == 0 => format!("{} mutation(s) synced", synced),
            None => format!("{} synced, {} failed", synced, failed),
        };

        if success {
            self.inner.marks.lock().await.last_successful_sync_at = Some(Utc::now());
            tracing::info!(run_id, synced, "Sync completed");
            self.inner.bus.publish(SyncEvent::Completed { run_id, synced });
        } else {
            tracing::warn!(run_id, synced, failed, message = %message, "Sync finished with failures");
            self.inner.bus.publish(SyncEvent::Failed {
                run_id,
                synced,
                failed,
                message: message.clone(),
            });
        }

        self.set_state(EngineState::Idle);
        self.publish_statistics().await;

        SyncResult {
            success,
            message,
            coalesced: false,
            items,
        }
    }

    /// Attempts one mutation and settles its queue entry.
    async fn process(&self, run_id: u64, m: Mutation) -> ItemResult {
        let applier = match self.inner.registry.get(&m.entity_type) {
            Ok(applier) => applier,
            Err(e) => {
                tracing::error!(mutation_id = %m.id, error = %e, "No applier for queued mutation");
                return self.fail_permanently(run_id, &m, &e.to_string()).await;
            }
        };

        let mode = if m.force_next {
            ApplyMode::Force
        } else {
            ApplyMode::Normal
        };

        match self.attempt(applier.as_ref(), &m, mode).await {
            Ok(()) => self.complete(run_id, &m, None).await,
            Err(ApplyError::Transient(error)) => self.retry_or_fail(run_id, &m, &error).await,
            Err(ApplyError::Conflict { remote }) => {
                self.handle_conflict(run_id, m, applier.as_ref(), remote).await
            }
            Err(ApplyError::Permanent(error)) => self.fail_permanently(run_id, &m, &error).await,
        }
    }

    /// One bounded remote call. A timeout is a transient failure.
    async fn attempt(
        &self,
        applier: &dyn RemoteApplier,
        m: &Mutation,
        mode: ApplyMode,
    ) -> std::result::Result<(), ApplyError> {
        let limit = self.inner.config.call_timeout;
        match timeout(limit, applier.apply(m, mode)).await {
            Ok(result) => result,
            Err(_) => Err(ApplyError::Transient(format!(
                "remote call timed out after {:?}",
                limit
            ))),
        }
    }

    async fn complete(
        &self,
        run_id: u64,
        m: &Mutation,
        strategy: Option<ConflictStrategy>,
    ) -> ItemResult {
        if let Err(e) = self.inner.queue.mark_completed(&m.id).await {
            tracing::warn!(mutation_id = %m.id, error = %e, "Could not mark mutation completed");
        }
        tracing::debug!(mutation_id = %m.id, "Mutation synced");

        let outcome = match strategy {
            Some(strategy) => {
                self.inner.bus.publish(SyncEvent::ConflictResolved {
                    run_id,
                    mutation_id: m.id.clone(),
                    strategy,
                    payload: Some(m.payload.clone()),
                });
                ItemOutcome::Resolved { strategy }
            }
            None => {
                self.inner.bus.publish(SyncEvent::ItemSynced {
                    run_id,
                    mutation_id: m.id.clone(),
                    entity_type: m.entity_type.clone(),
                });
                ItemOutcome::Synced
            }
        };
        item(m, outcome)
    }

    /// Schedules a backoff retry, or demotes to permanent failure once the
    /// retry budget is spent.
    async fn retry_or_fail(&self, run_id: u64, m: &Mutation, error: &str) -> ItemResult {
        let policy = self.inner.config.retry;
        let retry_count = m.retry_count + 1;
        if policy.is_exhausted(retry_count) {
            let error = format!("retries exhausted: {}", error);
            return self.fail_permanently(run_id, m, &error).await;
        }

        let retry_at = policy.next_attempt_at(Utc::now(), retry_count);
        if let Err(e) = self
            .inner
            .queue
            .mark_failed_retryable(&m.id, error, retry_at)
            .await
        {
            tracing::warn!(mutation_id = %m.id, error = %e, "Could not schedule retry");
        }

        tracing::info!(
            mutation_id = %m.id,
            retry_count,
            retry_at = %retry_at,
            error = %error,
            "Transient failure, retry scheduled"
        );
        self.inner.bus.publish(SyncEvent::ItemFailed {
            run_id,
            mutation_id: m.id.clone(),
            error: error.to_string(),
            retry_count,
            retry_at: Some(retry_at),
        });
        item(
            m,
            ItemOutcome::Retrying {
                retry_count,
                retry_at,
            },
        )
    }

    async fn fail_permanently(&self, run_id: u64, m: &Mutation, error: &str) -> ItemResult {
        if let Err(e) = self.inner.queue.mark_failed_permanent(&m.id, error).await {
            tracing::warn!(mutation_id = %m.id, error = %e, "Could not mark mutation failed");
        }

        tracing::warn!(mutation_id = %m.id, error = %error, "Mutation failed permanently");
        self.inner.bus.publish(SyncEvent::ItemFailed {
            run_id,
            mutation_id: m.id.clone(),
            error: error.to_string(),
            retry_count: m.retry_count,
            retry_at: None,
        });
        item(
            m,
            ItemOutcome::Failed {
                error: error.to_string(),
            },
        )
    }

    async fn handle_conflict(
        &self,
        run_id: u64,
        m: Mutation,
        applier: &dyn RemoteApplier,
        remote: Option<Payload>,
    ) -> ItemResult {
        // A conflict after a forced write, or a second one for the same id, is terminal.
        if m.force_next || m.conflict_count > 0 {
            return self
                .fail_permanently(run_id, &m, "conflict persisted after resolution")
                .await;
        }

        let remote = match remote {
            Some(remote) => Some(remote),
            None => {
                let limit = self.inner.config.call_timeout;
                match timeout(limit, applier.fetch_remote(&m.entity_type, &m.entity_id)).await {
                    Ok(Ok(remote)) => remote,
                    Ok(Err(ApplyError::Permanent(e))) => {
                        return self.fail_permanently(run_id, &m, &e).await;
                    }
                    Ok(Err(e)) => {
                        return self.retry_or_fail(run_id, &m, &e.to_string()).await;
                    }
                    Err(_) => {
                        return self
                            .retry_or_fail(run_id, &m, "remote fetch timed out")
                            .await;
                    }
                }
            }
        };

        let resolution = match &remote {
            Some(remote) => self.inner.resolver.resolve(&m, remote),
            None if self.inner.resolver.policy_for(&m.entity_type) == &FallbackPolicy::Manual => {
                ConflictResolution::manual()
            }
            None => {
                return self
                    .fail_permanently(run_id, &m, "conflict reported without a remote record")
                    .await;
            }
        };

        tracing::info!(
            mutation_id = %m.id,
            strategy = %resolution.strategy,
            "Conflict detected"
        );
        self.inner.bus.publish(SyncEvent::ConflictDetected {
            run_id,
            mutation_id: m.id.clone(),
            entity_type: m.entity_type.clone(),
            strategy: resolution.strategy,
            local: m.payload.clone(),
            remote: remote.clone(),
        });

        match (resolution.strategy, resolution.payload) {
            (ConflictStrategy::UseServer, Some(server)) => {
                self.settle_with_server(run_id, &m, server).await
            }
            (ConflictStrategy::UseLocal, Some(payload)) => {
                self.force_resubmit(run_id, m, applier, payload, ConflictStrategy::UseLocal)
                    .await
            }
            (ConflictStrategy::Merge, Some(merged)) => {
                self.write_local(&m.entity_type, &m.entity_id, &merged).await;
                self.force_resubmit(run_id, m, applier, merged, ConflictStrategy::Merge)
                    .await
            }
            _ => self.park(run_id, &m, remote).await,
        }
    }

    /// Adopts the server copy locally. Nothing is re-sent, so nothing can
    /// be applied twice.
    async fn settle_with_server(&self, run_id: u64, m: &Mutation, server: Payload) -> ItemResult {
        self.write_local(&m.entity_type, &m.entity_id, &server).await;
        if let Err(e) = self.inner.queue.complete_with(&m.id, server.clone()).await {
            tracing::warn!(mutation_id = %m.id, error = %e, "Could not settle conflict");
        }

        self.inner.bus.publish(SyncEvent::ConflictResolved {
            run_id,
            mutation_id: m.id.clone(),
            strategy: ConflictStrategy::UseServer,
            payload: Some(server),
        });
        item(
            m,
            ItemOutcome::Resolved {
                strategy: ConflictStrategy::UseServer,
            },
        )
    }

    /// Re-submits once with overwrite semantics.
    async fn force_resubmit(
        &self,
        run_id: u64,
        mut m: Mutation,
        applier: &dyn RemoteApplier,
        payload: Payload,
        strategy: ConflictStrategy,
    ) -> ItemResult {
        let rewrite = (payload != m.payload).then(|| payload.clone());
        if let Err(e) = self.inner.queue.note_conflict(&m.id, rewrite, true).await {
            tracing::warn!(mutation_id = %m.id, error = %e, "Could not record conflict");
        }
        m.payload = payload;
        m.force_next = true;
        m.conflict_count += 1;

        match self.attempt(applier, &m, ApplyMode::Force).await {
            Ok(()) => self.complete(run_id, &m, Some(strategy)).await,
            Err(ApplyError::Transient(error)) => self.retry_or_fail(run_id, &m, &error).await,
            Err(ApplyError::Conflict { .. }) => {
                self.fail_permanently(run_id, &m, "conflict persisted after forced overwrite")
                    .await
            }
            Err(ApplyError::Permanent(error)) => self.fail_permanently(run_id, &m, &error).await,
        }
    }

    async fn park(&self, run_id: u64, m: &Mutation, remote: Option<Payload>) -> ItemResult {
        if let Err(e) = self.inner.queue.park_for_manual(&m.id, remote).await {
            tracing::warn!(mutation_id = %m.id, error = %e, "Could not park conflict");
        }
        tracing::info!(mutation_id = %m.id, run_id, "Conflict parked for manual resolution");
        item(m, ItemOutcome::NeedsManualResolution)
    }

    /// Settles parked manual conflicts older than the configured expiry with
    /// the server copy captured when they were parked.
    async fn expire_manual_conflicts(&self, run_id: u64) -> Vec<ItemResult> {
        let Some(expiry) = self.inner.config.manual_conflict_expiry else {
            return Vec::new();
        };
        let Ok(expiry) = chrono::Duration::from_std(expiry) else {
            return Vec::new();
        };

        let cutoff = Utc::now() - expiry;
        let mut items = Vec::new();
        for m in self.inner.queue.parked_before(cutoff).await {
            tracing::info!(mutation_id = %m.id, "Manual conflict expired, using server copy");
            match m.remote_snapshot.clone() {
                Some(server) => items.push(self.settle_with_server(run_id, &m, server).await),
                None => {
                    if let Err(e) = self.inner.queue.cancel(&m.id).await {
                        tracing::warn!(mutation_id = %m.id, error = %e, "Could not cancel expired conflict");
                    }
                }
            }
        }
        items
    }

    async fn prune_finished(&self) {
        let Some(retention) = self.inner.config.completed_retention else {
            return;
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };
        match self.inner.queue.prune_finished(Utc::now() - retention).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(count = n, "Pruned finished mutations"),
            Err(e) => tracing::warn!(error = %e, "Failed to prune finished mutations"),
        }
    }

    pub(super) async fn reconcile_locked(&self, reconciler: &dyn Reconciler) -> Result<ReconcileReport> {
        self.set_state(EngineState::Reconciling);
        let since = self.inner.marks.lock().await.reconcile_cursor;
        let started = Utc::now();

        let protected = self.unsynced_keys().await;
        let store = ProtectedStore {
            inner: self.inner.store.as_ref(),
            protected,
        };
        let result = reconciler.reconcile(&store, since).await;
        self.set_state(EngineState::Idle);

        match result {
            Ok(report) => {
                {
                    let mut marks = self.inner.marks.lock().await;
                    marks.last_reconciled_at = Some(started);
                    marks.reconcile_cursor = Some(started - RECONCILE_OVERLAP);
                }
                tracing::info!(records = report.records_updated, "Reconciliation completed");
                self.inner.bus.publish(SyncEvent::Reconciled {
                    records_updated: report.records_updated,
                });
                self.publish_statistics().await;
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reconciliation failed");
                self.inner.bus.publish(SyncEvent::ReconcileFailed {
                    message: e.to_string(),
                });
                Err(SyncError::Reconcile(e))
            }
        }
    }

    /// `(table, key)` pairs with local changes the remote has not confirmed.
    async fn unsynced_keys(&self) -> HashSet<(String, String)> {
        self.inner
            .queue
            .list()
            .await
            .into_iter()
            .filter(|m| {
                matches!(m.status, MutationStatus::Pending | MutationStatus::Processing)
                    || m.needs_manual_resolution
            })
            .map(|m| (m.entity_type.as_str().to_string(), m.entity_id))
            .collect()
    }
}

fn item(m: &Mutation, outcome: ItemOutcome) -> ItemResult {
    ItemResult {
        mutation_id: m.id.clone(),
        entity_type: m.entity_type.clone(),
        outcome,
    }
}

/// Store view handed to reconcilers: records with unconfirmed local changes
/// are not overwritten by the pull.
struct ProtectedStore<'a> {
    inner: &'a dyn LocalStore,
    protected: HashSet<(String, String)>,
}

impl ProtectedStore<'_> {
    fn is_protected(&self, table: &str, key: &str) -> bool {
        self.protected
            .contains(&(table.to_string(), key.to_string()))
    }
}

#[async_trait]
impl LocalStore for ProtectedStore<'_> {
    async fn put(&self, table: &str, key: &str, record: Value) -> std::result::Result<(), StoreError> {
        if self.is_protected(table, key) {
            tracing::debug!(table, key, "Skipping pull over unsynced local change");
            return Ok(());
        }
        self.inner.put(table, key, record).await
    }

    async fn get(&self, table: &str, key: &str) -> std::result::Result<Option<Value>, StoreError> {
        self.inner.get(table, key).await
    }

    async fn query(
        &self,
        table: &str,
        filter: RecordFilter<'_>,
    ) -> std::result::Result<Vec<Value>, StoreError> {
        self.inner.query(table, filter).await
    }

    async fn delete(&self, table: &str, key: &str) -> std::result::Result<(), StoreError> {
        if self.is_protected(table, key) {
            return Ok(());
        }
        self.inner.delete(table, key).await
    }
}
