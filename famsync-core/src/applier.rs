//! Remote applier registry.
//!
//! The host implements [`RemoteApplier`] for its transport and registers one
//! per entity type. The engine never looks inside payloads on their way out;
//! it only reads the classified outcome.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ApplyError, SyncError};
use crate::models::{EntityType, Mutation, Payload};

/// How an attempt should treat the remote version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Regular write; the remote rejects stale bases with a conflict.
    Normal,
    /// Overwrite regardless of the remote version.
    Force,
}

/// Applies one mutation against the remote store.
#[async_trait]
pub trait RemoteApplier: Send + Sync {
    async fn apply(&self, mutation: &Mutation, mode: ApplyMode) -> Result<(), ApplyError>;

    /// Fetches the authoritative remote copy of a record, used when a
    /// conflict response did not carry it.
    async fn fetch_remote(
        &self,
        _entity_type: &EntityType,
        _entity_id: &str,
    ) -> Result<Option<Payload>, ApplyError> {
        Ok(None)
    }
}

/// Maps entity types to their appliers.
#[derive(Clone, Default)]
pub struct ApplierRegistry {
    appliers: HashMap<EntityType, Arc<dyn RemoteApplier>>,
    fallback: Option<Arc<dyn RemoteApplier>>,
}

impl std::fmt::Debug for ApplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.appliers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("ApplierRegistry")
            .field("entity_types", &types)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ApplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the applier for one entity type, replacing any previous one.
    pub fn register(&mut self, entity_type: EntityType, applier: Arc<dyn RemoteApplier>) {
        self.appliers.insert(entity_type, applier);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, entity_type: EntityType, applier: Arc<dyn RemoteApplier>) -> Self {
        self.register(entity_type, applier);
        self
    }

    /// Applier used for any entity type without a dedicated registration.
    pub fn with_fallback(mut self, applier: Arc<dyn RemoteApplier>) -> Self {
        self.fallback = Some(applier);
        self
    }

    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.appliers.contains_key(entity_type) || self.fallback.is_some()
    }

    /// Looks up the applier for an entity type.
    pub fn get(&self, entity_type: &EntityType) -> Result<Arc<dyn RemoteApplier>, SyncError> {
        self.appliers
            .get(entity_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl RemoteApplier for Named {
        async fn apply(&self, _mutation: &Mutation, _mode: ApplyMode) -> Result<(), ApplyError> {
            Err(ApplyError::Permanent(self.0.to_string()))
        }
    }

    fn name_of(applier: Arc<dyn RemoteApplier>) -> String {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let payload = serde_json::json!({"id": "x"}).as_object().cloned().unwrap();
        let m = Mutation::new(
            EntityType::Task,
            crate::models::Operation::Insert,
            payload,
            chrono::Utc::now(),
        )
        .unwrap();
        match rt.block_on(applier.apply(&m, ApplyMode::Normal)) {
            Err(ApplyError::Permanent(name)) => name,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_lookup_by_entity_type() {
        let registry = ApplierRegistry::new()
            .with(EntityType::Task, Arc::new(Named("task")))
            .with(EntityType::Redemption, Arc::new(Named("redemption")));

        assert_eq!(name_of(registry.get(&EntityType::Task).unwrap()), "task");
        assert_eq!(
            name_of(registry.get(&EntityType::Redemption).unwrap()),
            "redemption"
        );
        assert!(!registry.contains(&EntityType::User));
        assert!(matches!(
            registry.get(&EntityType::User),
            Err(SyncError::UnknownEntityType(EntityType::User))
        ));
    }

    #[test]
    fn test_fallback_covers_unregistered_types() {
        let registry = ApplierRegistry::new()
            .with(EntityType::Task, Arc::new(Named("task")))
            .with_fallback(Arc::new(Named("http")));

        assert!(registry.contains(&EntityType::Other("reward".to_string())));
        assert_eq!(name_of(registry.get(&EntityType::User).unwrap()), "http");
        assert_eq!(name_of(registry.get(&EntityType::Task).unwrap()), "task");
    }
}
