use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::{EntityType, Operation};
use crate::error::SyncError;

/// Opaque record body. Only appliers interpret it; the engine itself reads
/// nothing beyond `id`, `updated_at` and merge allow-list fields.
pub type Payload = serde_json::Map<String, Value>;

/// Lifecycle status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Processing => "processing",
            MutationStatus::Completed => "completed",
            MutationStatus::Failed => "failed",
            MutationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued, not-yet-confirmed local change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// `<entity_type>:<entity_id>:<operation>`
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub status: MutationStatus,
    /// Reserved. Higher values dequeue first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Conflicts seen for this id; a second one is terminal.
    #[serde(default)]
    pub conflict_count: u32,
    /// Next attempt overwrites the remote copy, bypassing its version check.
    #[serde(default)]
    pub force_next: bool,
    #[serde(default)]
    pub needs_manual_resolution: bool,
    /// Server version captured when the mutation was parked for manual resolution.
    #[serde(default)]
    pub remote_snapshot: Option<Payload>,
    #[serde(default)]
    pub parked_at: Option<DateTime<Utc>>,
    /// Newer local write that arrived while this mutation was in flight.
    #[serde(default)]
    pub superseded_payload: Option<Payload>,
}

impl Mutation {
    /// Builds a fresh pending mutation, taking the entity id from the payload's `id` field.
    pub fn new(
        entity_type: EntityType,
        operation: Operation,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        let entity_id = entity_id_from(&payload)?;
        Ok(Self {
            id: Self::id_for(&entity_type, &entity_id, operation),
            entity_type,
            entity_id,
            operation,
            payload,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            next_eligible_at: now,
            status: MutationStatus::Pending,
            priority: 0,
            last_error: None,
            conflict_count: 0,
            force_next: false,
            needs_manual_resolution: false,
            remote_snapshot: None,
            parked_at: None,
            superseded_payload: None,
        })
    }

    /// Stable identity for a logical change.
    pub fn id_for(entity_type: &EntityType, entity_id: &str, operation: Operation) -> String {
        format!("{}:{}:{}", entity_type, entity_id, operation)
    }

    /// True when the mutation may be dequeued at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == MutationStatus::Pending && self.next_eligible_at <= now
    }

    /// True while later mutations for the same entity must wait behind this one.
    ///
    /// Pending and in-flight entries hold their entity, and so does a parked
    /// manual conflict until it is resolved or expires. Permanent failures
    /// and finished entries do not.
    pub fn holds_entity(&self) -> bool {
        match self.status {
            MutationStatus::Pending | MutationStatus::Processing => true,
            MutationStatus::Failed => self.needs_manual_resolution,
            MutationStatus::Completed | MutationStatus::Cancelled => false,
        }
    }
}

/// Extracts the entity id from a payload. Accepts string or integer ids.
pub fn entity_id_from(payload: &Payload) -> Result<String, SyncError> {
    match payload.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(SyncError::InvalidPayload(
            "field 'id' must be a non-empty string or a number".to_string(),
        )),
        None => Err(SyncError::InvalidPayload(
            "payload has no 'id' field".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_derives_stable_id() {
        let now = Utc::now();
        let m = Mutation::new(
            EntityType::Task,
            Operation::Update,
            payload(json!({"id": "t-1", "title": "Clean room"})),
            now,
        )
        .unwrap();

        assert_eq!(m.id, "task:t-1:update");
        assert_eq!(m.entity_id, "t-1");
        assert_eq!(m.status, MutationStatus::Pending);
        assert_eq!(m.retry_count, 0);
        assert!(m.is_eligible(now));
    }

    #[test]
    fn test_numeric_entity_id() {
        let m = Mutation::new(
            EntityType::Redemption,
            Operation::Insert,
            payload(json!({"id": 42, "points": 40})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(m.id, "redemption:42:insert");
    }

    #[test]
    fn test_missing_id_rejected() {
        let result = Mutation::new(
            EntityType::Task,
            Operation::Insert,
            payload(json!({"title": "no id"})),
            Utc::now(),
        );
        assert!(matches!(result, Err(SyncError::InvalidPayload(_))));

        let result = Mutation::new(
            EntityType::Task,
            Operation::Insert,
            payload(json!({"id": ""})),
            Utc::now(),
        );
        assert!(matches!(result, Err(SyncError::InvalidPayload(_))));
    }

    #[test]
    fn test_not_eligible_before_next_eligible_at() {
        let now = Utc::now();
        let mut m = Mutation::new(
            EntityType::Task,
            Operation::Update,
            payload(json!({"id": "t-1"})),
            now,
        )
        .unwrap();
        m.next_eligible_at = now + chrono::Duration::seconds(5);
        assert!(!m.is_eligible(now));

        m.next_eligible_at = now;
        m.status = MutationStatus::Failed;
        assert!(!m.is_eligible(now));
    }

    #[test]
    fn test_deserialize_with_missing_bookkeeping_fields() {
        let now = Utc::now();
        let m = Mutation::new(
            EntityType::Task,
            Operation::Update,
            payload(json!({"id": "t-1"})),
            now,
        )
        .unwrap();

        let mut value = serde_json::to_value(&m).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("conflict_count");
        obj.remove("force_next");
        obj.remove("superseded_payload");

        let restored: Mutation = serde_json::from_value(value).unwrap();
        assert_eq!(restored, m);
    }
}
