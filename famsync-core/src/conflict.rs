//! Per-entity conflict resolution.
//!
//! When both copies of a record carry a comparable `updated_at`, the later
//! write wins outright. Otherwise the entity type's [`FallbackPolicy`]
//! decides. The resolver is pure; applying its decision (forced re-submit,
//! local overwrite, parking) is the orchestrator's job.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::{ConflictResolution, EntityType, Mutation, Payload};

/// Field compared for last-writer-wins.
pub const DEFAULT_TIMESTAMP_FIELD: &str = "updated_at";

/// What to do when timestamps cannot decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Remote is authoritative. For append-only records that must never be
    /// applied twice.
    UseServer,
    /// Local write overwrites the remote copy.
    UseLocal,
    /// Remote as base with locally owned fields overlaid.
    Merge { local_fields: Vec<String> },
    /// Park until a person picks the final version.
    Manual,
}

impl FallbackPolicy {
    /// Merge policy over the given locally owned fields.
    pub fn merge<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FallbackPolicy::Merge {
            local_fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Selects a resolution strategy for a rejected mutation.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    policies: HashMap<EntityType, FallbackPolicy>,
    default_policy: FallbackPolicy,
    timestamp_field: String,
}

impl Default for ConflictResolver {
    /// Family-app defaults: redemptions are server-authoritative, user
    /// preferences merge, tasks and completions need a person to decide.
    fn default() -> Self {
        Self::new(FallbackPolicy::UseServer)
            .with_policy(EntityType::Redemption, FallbackPolicy::UseServer)
            .with_policy(
                EntityType::User,
                FallbackPolicy::merge(["preferences", "theme", "language", "notifications_enabled"]),
            )
            .with_policy(EntityType::Task, FallbackPolicy::Manual)
            .with_policy(EntityType::TaskCompletion, FallbackPolicy::Manual)
    }
}

impl ConflictResolver {
    /// Resolver with no per-type policies.
    pub fn new(default_policy: FallbackPolicy) -> Self {
        Self {
            policies: HashMap::new(),
            default_policy,
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
        }
    }

    pub fn with_policy(mut self, entity_type: EntityType, policy: FallbackPolicy) -> Self {
        self.policies.insert(entity_type, policy);
        self
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    pub fn policy_for(&self, entity_type: &EntityType) -> &FallbackPolicy {
        self.policies
            .get(entity_type)
            .unwrap_or(&self.default_policy)
    }

    /// Decides how to settle `mutation` against the remote snapshot.
    pub fn resolve(&self, mutation: &Mutation, remote: &Payload) -> ConflictResolution {
        let local = &mutation.payload;

        let local_ts = timestamp_of(local, &self.timestamp_field);
        let remote_ts = timestamp_of(remote, &self.timestamp_field);
        if let (Some(l), Some(r)) = (local_ts, remote_ts) {
            if l > r {
                return ConflictResolution::use_local(local.clone());
            }
            if r > l {
                return ConflictResolution::use_server(remote.clone());
            }
        }

        match self.policy_for(&mutation.entity_type) {
            FallbackPolicy::UseServer => ConflictResolution::use_server(remote.clone()),
            FallbackPolicy::UseLocal => ConflictResolution::use_local(local.clone()),
            FallbackPolicy::Merge { local_fields } => {
                ConflictResolution::merge(merge_fields(remote, local, local_fields))
            }
            FallbackPolicy::Manual => ConflictResolution::manual(),
        }
    }
}

/// Remote as base, with `local_fields` copied over from `local` where present.
pub fn merge_fields(remote: &Payload, local: &Payload, local_fields: &[String]) -> Payload {
    let mut merged = remote.clone();
    for field in local_fields {
        if let Some(value) = local.get(field) {
            merged.insert(field.clone(), value.clone());
        }
    }
    merged
}

/// Reads a timestamp as RFC 3339 text or epoch milliseconds.
pub fn timestamp_of(payload: &Payload, field: &str) -> Option<DateTime<Utc>> {
    match payload.get(field)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictStrategy, Operation};
    use serde_json::json;

    fn obj(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn mutation(entity_type: EntityType, payload: Value) -> Mutation {
        Mutation::new(entity_type, Operation::Update, obj(payload), Utc::now()).unwrap()
    }

    #[test]
    fn test_later_timestamp_wins() {
        let resolver = ConflictResolver::default();
        let m = mutation(
            EntityType::Task,
            json!({"id": "t", "title": "local", "updated_at": "2026-01-02T10:00:00Z"}),
        );

        let older = obj(json!({"id": "t", "title": "remote", "updated_at": "2026-01-01T10:00:00Z"}));
        let resolution = resolver.resolve(&m, &older);
        assert_eq!(resolution.strategy, ConflictStrategy::UseLocal);
        assert_eq!(resolution.payload.unwrap()["title"], "local");

        let newer = obj(json!({"id": "t", "title": "remote", "updated_at": 1_800_000_000_000i64}));
        let resolution = resolver.resolve(&m, &newer);
        assert_eq!(resolution.strategy, ConflictStrategy::UseServer);
        assert_eq!(resolution.payload.unwrap()["title"], "remote");
    }

    #[test]
    fn test_equal_timestamps_fall_back_to_policy() {
        let resolver = ConflictResolver::default();
        let ts = "2026-03-01T08:00:00Z";
        let m = mutation(EntityType::Task, json!({"id": "t", "updated_at": ts}));
        let remote = obj(json!({"id": "t", "updated_at": ts}));

        let resolution = resolver.resolve(&m, &remote);
        assert_eq!(resolution.strategy, ConflictStrategy::Manual);
        assert!(resolution.payload.is_none());
    }

    #[test]
    fn test_redemption_uses_server_without_timestamps() {
        let resolver = ConflictResolver::default();
        let m = mutation(EntityType::Redemption, json!({"id": "r-1", "points": 40}));
        let remote = obj(json!({"id": "r-1", "points": 50}));

        let resolution = resolver.resolve(&m, &remote);
        assert_eq!(resolution.strategy, ConflictStrategy::UseServer);
        assert_eq!(resolution.payload.unwrap(), remote);
    }

    #[test]
    fn test_user_merge_overlays_allow_listed_fields() {
        let resolver = ConflictResolver::default();
        let m = mutation(
            EntityType::User,
            json!({"id": "u", "name": "Local Name", "theme": "dark", "points": 1}),
        );
        let remote = obj(json!({"id": "u", "name": "Server Name", "theme": "light", "points": 90}));

        let resolution = resolver.resolve(&m, &remote);
        assert_eq!(resolution.strategy, ConflictStrategy::Merge);
        let merged = resolution.payload.unwrap();
        assert_eq!(merged["name"], "Server Name");
        assert_eq!(merged["points"], 90);
        assert_eq!(merged["theme"], "dark");
    }

    #[test]
    fn test_policy_override_and_default() {
        let resolver = ConflictResolver::new(FallbackPolicy::UseLocal)
            .with_policy(EntityType::Family, FallbackPolicy::UseServer);

        let m = mutation(EntityType::Other("reward".into()), json!({"id": "x", "v": 1}));
        let remote = obj(json!({"id": "x", "v": 2}));
        assert_eq!(
            resolver.resolve(&m, &remote).strategy,
            ConflictStrategy::UseLocal
        );

        let m = mutation(EntityType::Family, json!({"id": "f"}));
        assert_eq!(
            resolver.resolve(&m, &obj(json!({"id": "f"}))).strategy,
            ConflictStrategy::UseServer
        );
    }

    #[test]
    fn test_timestamp_parsing() {
        let p = obj(json!({"a": "2026-01-01T00:00:00+02:00", "b": 0, "c": "yesterday", "d": true}));
        assert_eq!(
            timestamp_of(&p, "a").unwrap().to_rfc3339(),
            "2025-12-31T22:00:00+00:00"
        );
        assert_eq!(timestamp_of(&p, "b").unwrap().timestamp(), 0);
        assert!(timestamp_of(&p, "c").is_none());
        assert!(timestamp_of(&p, "d").is_none());
        assert!(timestamp_of(&p, "missing").is_none());
    }

    #[test]
    fn test_custom_timestamp_field() {
        let resolver = ConflictResolver::new(FallbackPolicy::Manual).with_timestamp_field("modified");
        let m = mutation(EntityType::Task, json!({"id": "t", "modified": 200}));
        let remote = obj(json!({"id": "t", "modified": 100}));
        assert_eq!(
            resolver.resolve(&m, &remote).strategy,
            ConflictStrategy::UseLocal
        );
    }
}
