//! Durable, ordered queue of pending mutations.
//!
//! The queue owns every [`Mutation`]. All reads and writes go through one
//! async mutex, and every mutating operation is written through to the
//! [`LocalStore`] before the lock is released, so the durable copy never lags
//! behind more than the operation that failed to persist.
//!
//! # Single flight
//!
//! `dequeue_batch` hands out only `pending` entries and flips them to
//! `processing` under the lock. Entries are grouped by entity (type plus
//! entity id); only the oldest entry still holding an entity is a candidate,
//! so an insert and a later update of the same record are never in flight
//! together and always reach the remote in enqueue order.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::models::{
    entity_id_from, EntityType, Mutation, MutationStatus, Payload, StatusCounts,
};
use crate::store::LocalStore;

/// Table the queue persists itself into.
pub const QUEUE_TABLE: &str = "mutation_queue";

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<String, Mutation>,
    /// Set when a write-through failed; memory may be ahead of the store.
    diverged: bool,
}

/// Durable mutation queue backed by a [`LocalStore`].
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue").finish_non_exhaustive()
    }
}

impl MutationQueue {
    /// Opens the queue, loading any entries left in the store.
    ///
    /// Entries found `processing` were interrupted mid-attempt by a restart
    /// and are put back to `pending`.
    pub async fn open(store: Arc<dyn LocalStore>) -> Result<Self> {
        let queue = Self {
            store,
            state: Mutex::new(QueueState::default()),
        };
        queue.reload().await?;
        Ok(queue)
    }

    /// Discards in-memory state and re-reads the queue from the store.
    pub async fn reload(&self) -> Result<usize> {
        let records = self
            .store
            .query(QUEUE_TABLE, &|_: &Value| true)
            .await
            .map_err(SyncError::QueuePersistence)?;

        let mut entries = HashMap::with_capacity(records.len());
        let mut interrupted = Vec::new();
        for record in records {
            match serde_json::from_value::<Mutation>(record) {
                Ok(mut m) => {
                    if m.status == MutationStatus::Processing {
                        m.status = MutationStatus::Pending;
                        interrupted.push(m.id.clone());
                    }
                    entries.insert(m.id.clone(), m);
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable queue record"),
            }
        }

        let mut state = self.state.lock().await;
        state.entries = entries;
        state.diverged = false;

        for id in &interrupted {
            if let Some(m) = state.entries.get(id) {
                let m = m.clone();
                self.write(&mut state, &m).await?;
            }
        }
        if !interrupted.is_empty() {
            tracing::info!(
                count = interrupted.len(),
                "Reset interrupted mutations to pending"
            );
        }

        Ok(state.entries.len())
    }

    /// True when a previous write-through failed and memory may not match the store.
    pub async fn is_diverged(&self) -> bool {
        self.state.lock().await.diverged
    }

    /// Idempotent upsert by id.
    ///
    /// - `pending`: payload replaced, retry count kept.
    /// - `failed`: payload replaced, retry count kept, back to `pending`
    ///   unless parked for manual resolution.
    /// - `processing`: payload held until the in-flight attempt settles.
    /// - `completed` / `cancelled` / absent: stored as a fresh entry.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<String> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let id = mutation.id.clone();

        let updated = match state.entries.get(&id) {
            Some(existing) => {
                let mut m = existing.clone();
                match m.status {
                    MutationStatus::Pending => {
                        m.payload = mutation.payload;
                    }
                    MutationStatus::Failed => {
                        m.payload = mutation.payload;
                        if !m.needs_manual_resolution {
                            m.status = MutationStatus::Pending;
                            m.next_eligible_at = now;
                        }
                    }
                    MutationStatus::Processing => {
                        m.superseded_payload = Some(mutation.payload);
                    }
                    MutationStatus::Completed | MutationStatus::Cancelled => {
                        m = mutation;
                    }
                }
                m.updated_at = now;
                m
            }
            None => mutation,
        };

        tracing::debug!(mutation_id = %id, status = %updated.status, "Queued mutation");
        self.write(&mut state, &updated).await?;
        Ok(id)
    }

    /// Takes up to `max` eligible entries and marks them `processing`.
    pub async fn dequeue_batch(&self, max: usize) -> Result<Vec<Mutation>> {
        self.dequeue_batch_at(max, Utc::now()).await
    }

    /// Like [`dequeue_batch`](Self::dequeue_batch) with an explicit clock reading.
    ///
    /// Ordered by priority (highest first), then `created_at` (oldest first).
    /// At most one entry per entity is taken, and only when no older entry
    /// for that entity is still pending, in flight or parked.
    pub async fn dequeue_batch_at(&self, max: usize, now: DateTime<Utc>) -> Result<Vec<Mutation>> {
        let mut state = self.state.lock().await;

        let mut eligible: Vec<&Mutation> = entity_heads(&state.entries)
            .into_iter()
            .filter(|m| m.is_eligible(now))
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        let ids: Vec<String> = eligible.into_iter().take(max).map(|m| m.id.clone()).collect();

        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(m) = state.entries.get_mut(&id) else {
                continue;
            };
            m.status = MutationStatus::Processing;
            m.updated_at = now;
            let m = m.clone();
            self.write(&mut state, &m).await?;
            batch.push(m);
        }
        Ok(batch)
    }

    /// Marks an entry as successfully applied.
    ///
    /// If a newer local write arrived while the attempt was in flight, that
    /// write becomes the next pending attempt instead.
    pub async fn mark_completed(&self, id: &str) -> Result<Mutation> {
        self.update(id, |m, now| {
            m.last_error = None;
            m.force_next = false;
            match m.superseded_payload.take() {
                Some(payload) => {
                    m.payload = payload;
                    m.status = MutationStatus::Pending;
                    m.retry_count = 0;
                    m.conflict_count = 0;
                    m.next_eligible_at = now;
                }
                None => m.status = MutationStatus::Completed,
            }
            Ok(())
        })
        .await
    }

    /// Records a transient failure and schedules the next attempt.
    pub async fn mark_failed_retryable(
        &self,
        id: &str,
        error: &str,
        next_eligible_at: DateTime<Utc>,
    ) -> Result<Mutation> {
        self.update(id, |m, _| {
            m.retry_count += 1;
            m.status = MutationStatus::Pending;
            m.next_eligible_at = next_eligible_at;
            m.last_error = Some(error.to_string());
            if let Some(payload) = m.superseded_payload.take() {
                m.payload = payload;
            }
            Ok(())
        })
        .await
    }

    /// Stops automatic attempts. The entry stays visible until cleared.
    pub async fn mark_failed_permanent(&self, id: &str, error: &str) -> Result<Mutation> {
        self.update(id, |m, now| {
            m.last_error = Some(error.to_string());
            m.force_next = false;
            match m.superseded_payload.take() {
                Some(payload) => {
                    m.payload = payload;
                    m.status = MutationStatus::Pending;
                    m.next_eligible_at = now;
                }
                None => m.status = MutationStatus::Failed,
            }
            Ok(())
        })
        .await
    }

    /// Records a conflict on an in-flight entry. Optionally rewrites the
    /// payload (merge) and arms the forced re-submit.
    pub async fn note_conflict(
        &self,
        id: &str,
        payload: Option<Payload>,
        force_next: bool,
    ) -> Result<Mutation> {
        self.update(id, |m, _| {
            m.conflict_count += 1;
            m.force_next = force_next;
            if let Some(payload) = payload {
                m.payload = payload;
            }
            Ok(())
        })
        .await
    }

    /// Parks an entry until a final payload is supplied by hand.
    pub async fn park_for_manual(&self, id: &str, remote: Option<Payload>) -> Result<Mutation> {
        self.update(id, |m, now| {
            m.status = MutationStatus::Failed;
            m.needs_manual_resolution = true;
            m.remote_snapshot = remote;
            m.parked_at = Some(now);
            m.last_error = Some("conflict requires manual resolution".to_string());
            if let Some(payload) = m.superseded_payload.take() {
                m.payload = payload;
            }
            Ok(())
        })
        .await
    }

    /// Unparks a manual conflict with the final payload, to be force-applied
    /// on the next drain.
    pub async fn resolve_manual(&self, id: &str, mut payload: Payload) -> Result<Mutation> {
        self.update(id, move |m, now| {
            if !m.needs_manual_resolution {
                return Err(SyncError::NotParked(m.id.clone()));
            }
            match entity_id_from(&payload) {
                Ok(entity_id) if entity_id != m.entity_id => {
                    return Err(SyncError::InvalidPayload(format!(
                        "payload id '{}' does not match entity '{}'",
                        entity_id, m.entity_id
                    )));
                }
                Ok(_) => {}
                Err(_) => {
                    payload.insert("id".to_string(), Value::String(m.entity_id.clone()));
                }
            }
            m.payload = payload;
            m.status = MutationStatus::Pending;
            m.needs_manual_resolution = false;
            m.remote_snapshot = None;
            m.parked_at = None;
            m.last_error = None;
            m.force_next = true;
            m.next_eligible_at = now;
            Ok(())
        })
        .await
    }

    /// Settles a parked manual conflict on the server copy it was parked with.
    ///
    /// Nothing is queued for the remote; the returned entry carries the
    /// server payload for the caller to write locally.
    pub async fn resolve_manual_with_server(&self, id: &str) -> Result<Mutation> {
        let server = {
            let state = self.state.lock().await;
            let m = state
                .entries
                .get(id)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            if !m.needs_manual_resolution {
                return Err(SyncError::NotParked(m.id.clone()));
            }
            m.remote_snapshot.clone().ok_or_else(|| {
                SyncError::InvalidPayload(format!("no server copy recorded for '{}'", m.id))
            })?
        };
        self.complete_with(id, server).await
    }

    /// Settles an entry with the server's version without applying anything.
    ///
    /// A local write that arrived in the meantime is kept as the next
    /// pending attempt, as with [`mark_completed`](Self::mark_completed).
    pub async fn complete_with(&self, id: &str, payload: Payload) -> Result<Mutation> {
        self.update(id, |m, now| {
            m.needs_manual_resolution = false;
            m.remote_snapshot = None;
            m.parked_at = None;
            m.force_next = false;
            m.last_error = None;
            match m.superseded_payload.take() {
                Some(newer) => {
                    m.payload = newer;
                    m.status = MutationStatus::Pending;
                    m.retry_count = 0;
                    m.conflict_count = 0;
                    m.next_eligible_at = now;
                }
                None => {
                    m.payload = payload;
                    m.status = MutationStatus::Completed;
                }
            }
            Ok(())
        })
        .await
    }

    /// Cancels an entry that is not in flight. Returns `false` if it is.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let m = state
            .entries
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        if m.status == MutationStatus::Processing {
            return Ok(false);
        }
        m.status = MutationStatus::Cancelled;
        m.updated_at = Utc::now();
        let m = m.clone();
        self.write(&mut state, &m).await?;
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Option<Mutation> {
        self.state.lock().await.entries.get(id).cloned()
    }

    /// All entries, oldest first.
    pub async fn list(&self) -> Vec<Mutation> {
        let state = self.state.lock().await;
        let mut all: Vec<Mutation> = state.entries.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Mutations not yet confirmed by the remote: `pending` plus `processing`.
    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|m| {
                matches!(
                    m.status,
                    MutationStatus::Pending | MutationStatus::Processing
                )
            })
            .count()
    }

    pub async fn counts(&self) -> StatusCounts {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for m in state.entries.values() {
            match m.status {
                MutationStatus::Pending => counts.pending += 1,
                MutationStatus::Processing => counts.processing += 1,
                MutationStatus::Completed => counts.completed += 1,
                MutationStatus::Failed => counts.failed += 1,
                MutationStatus::Cancelled => counts.cancelled += 1,
            }
            if m.needs_manual_resolution {
                counts.needs_manual_resolution += 1;
            }
        }
        counts
    }

    /// Earliest time a pending entry becomes eligible.
    ///
    /// Entries waiting behind an older entry for the same entity are not
    /// counted; they become candidates only once that entry settles.
    pub async fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        entity_heads(&state.entries)
            .into_iter()
            .filter(|m| m.status == MutationStatus::Pending)
            .map(|m| m.next_eligible_at)
            .min()
    }

    /// Manual conflicts parked before `cutoff`.
    pub async fn parked_before(&self, cutoff: DateTime<Utc>) -> Vec<Mutation> {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|m| m.needs_manual_resolution && m.parked_at.is_some_and(|t| t < cutoff))
            .cloned()
            .collect()
    }

    /// Removes every `failed` entry, parked manual conflicts included.
    pub async fn clear_failed(&self) -> Result<usize> {
        self.remove_where(|m| m.status == MutationStatus::Failed).await
    }

    /// Removes every entry.
    pub async fn clear_all(&self) -> Result<usize> {
        self.remove_where(|_| true).await
    }

    /// Removes completed and cancelled entries last touched before `cutoff`.
    pub async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.remove_where(|m| {
            matches!(
                m.status,
                MutationStatus::Completed | MutationStatus::Cancelled
            ) && m.updated_at < cutoff
        })
        .await
    }

    async fn remove_where<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&Mutation) -> bool,
    {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state
            .entries
            .values()
            .filter(|m| predicate(*m))
            .map(|m| m.id.clone())
            .collect();

        for id in &ids {
            state.entries.remove(id);
            if let Err(e) = self.store.delete(QUEUE_TABLE, id).await {
                state.diverged = true;
                return Err(SyncError::QueuePersistence(e));
            }
        }
        Ok(ids.len())
    }

    async fn update<F>(&self, id: &str, f: F) -> Result<Mutation>
    where
        F: FnOnce(&mut Mutation, DateTime<Utc>) -> Result<()>,
    {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let m = state
            .entries
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        f(m, now)?;
        m.updated_at = now;
        let m = m.clone();
        self.write(&mut state, &m).await?;
        Ok(m)
    }

    /// Writes one entry to memory and through to the store.
    async fn write(&self, state: &mut QueueState, m: &Mutation) -> Result<()> {
        state.entries.insert(m.id.clone(), m.clone());

        let record = serde_json::to_value(m)
            .map_err(|e| SyncError::QueuePersistence(e.into()))?;
        if let Err(e) = self.store.put(QUEUE_TABLE, &m.id, record).await {
            state.diverged = true;
            tracing::error!(mutation_id = %m.id, error = %e, "Failed to persist queue entry");
            return Err(SyncError::QueuePersistence(e));
        }
        Ok(())
    }
}

/// Oldest entry holding each entity, by `created_at` then id.
fn entity_heads(entries: &HashMap<String, Mutation>) -> Vec<&Mutation> {
    let mut heads: HashMap<(&EntityType, &str), &Mutation> = HashMap::new();
    for m in entries.values().filter(|m| m.holds_entity()) {
        heads
            .entry((&m.entity_type, m.entity_id.as_str()))
            .and_modify(|head| {
                if (m.created_at, &m.id) < (head.created_at, &head.id) {
                    *head = m;
                }
            })
            .or_insert(m);
    }
    heads.into_values().collect()
}
