//! Sync lifecycle events and the statistics stream.
//!
//! Events travel over a bounded broadcast channel. A subscriber that falls
//! behind loses the oldest events (it sees `RecvError::Lagged`) instead of
//! stalling the orchestrator. Statistics use a `watch` channel: subscribers
//! always read the latest projection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::models::{ConflictStrategy, EntityType, Payload, SyncStatistics};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// One observable step of the sync lifecycle.
///
/// Every run emits `Started`, any number of item events, then exactly one
/// of `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Queued {
        mutation_id: String,
        entity_type: EntityType,
    },
    Started {
        run_id: u64,
        pending: usize,
    },
    ItemSynced {
        run_id: u64,
        mutation_id: String,
        entity_type: EntityType,
    },
    ConflictDetected {
        run_id: u64,
        mutation_id: String,
        entity_type: EntityType,
        strategy: ConflictStrategy,
        local: Payload,
        remote: Option<Payload>,
    },
    ConflictResolved {
        run_id: u64,
        mutation_id: String,
        strategy: ConflictStrategy,
        payload: Option<Payload>,
    },
    ItemFailed {
        run_id: u64,
        mutation_id: String,
        error: String,
        retry_count: u32,
        /// Next attempt time; `None` when the failure is permanent.
        retry_at: Option<DateTime<Utc>>,
    },
    Completed {
        run_id: u64,
        synced: usize,
    },
    Failed {
        run_id: u64,
        synced: usize,
        failed: usize,
        message: String,
    },
    Reconciled {
        records_updated: usize,
    },
    ReconcileFailed {
        message: String,
    },
}

impl SyncEvent {
    /// Run the event belongs to, if any.
    pub fn run_id(&self) -> Option<u64> {
        match self {
            SyncEvent::Started { run_id, .. }
            | SyncEvent::ItemSynced { run_id, .. }
            | SyncEvent::ConflictDetected { run_id, .. }
            | SyncEvent::ConflictResolved { run_id, .. }
            | SyncEvent::ItemFailed { run_id, .. }
            | SyncEvent::Completed { run_id, .. }
            | SyncEvent::Failed { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }

    /// True for the event that closes a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncEvent::Completed { .. } | SyncEvent::Failed { .. })
    }
}

/// Fan-out for events and statistics.
#[derive(Debug)]
pub struct EventBus {
    events: broadcast::Sender<SyncEvent>,
    statistics: watch::Sender<SyncStatistics>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (statistics, _) = watch::channel(SyncStatistics::default());
        Self { events, statistics }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        tracing::trace!(?event, "Sync event");
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Replaces the published statistics, waking subscribers only on change.
    pub fn publish_statistics(&self, statistics: SyncStatistics) {
        self.statistics.send_if_modified(|current| {
            if *current == statistics {
                false
            } else {
                *current = statistics;
                true
            }
        });
    }

    pub fn subscribe_statistics(&self) -> watch::Receiver<SyncStatistics> {
        self.statistics.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe_events();

        for run_id in 0..4 {
            bus.publish(SyncEvent::Completed { run_id, synced: 0 });
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        assert_eq!(rx.recv().await.unwrap().run_id(), Some(2));
        assert_eq!(rx.recv().await.unwrap().run_id(), Some(3));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(SyncEvent::Reconciled { records_updated: 1 });
    }

    #[tokio::test]
    async fn test_statistics_only_notify_on_change() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_statistics();

        bus.publish_statistics(SyncStatistics::default());
        assert!(!rx.has_changed().unwrap());

        let mut stats = SyncStatistics::default();
        stats.counts.pending = 3;
        bus.publish_statistics(stats);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().counts.pending, 3);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SyncEvent::ItemSynced {
            run_id: 7,
            mutation_id: "task:t-1:update".to_string(),
            entity_type: EntityType::Task,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item_synced");
        assert_eq!(json["entity_type"], "task");
        assert!(event.run_id().is_some());
        assert!(!event.is_terminal());
    }
}
