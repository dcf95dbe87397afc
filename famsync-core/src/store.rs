//! Local persistent store seam.
//!
//! The queue persists itself through this interface, and resolved conflicts
//! are written back through it so the local copy of a record matches the
//! version both sides agreed on. Records are JSON values keyed by
//! `(table, key)`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Predicate used by [`LocalStore::query`].
pub type RecordFilter<'a> = &'a (dyn Fn(&Value) -> bool + Send + Sync);

/// Narrow key-value interface over the host's local database.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<(), StoreError>;

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Returns every record in `table` matching `filter`, ordered by key.
    async fn query(&self, table: &str, filter: RecordFilter<'_>) -> Result<Vec<Value>, StoreError>;

    async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError>;
}

/// In-memory store. Useful for tests and for hosts that accept losing the
/// queue on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table.
    pub async fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| t.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn query(&self, table: &str, filter: RecordFilter<'_>) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|t| t.values().filter(|v| filter(v)).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        if let Some(t) = self.tables.write().await.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert!(store.get("task", "t-1").await.unwrap().is_none());

        store
            .put("task", "t-1", json!({"id": "t-1", "title": "Dishes"}))
            .await
            .unwrap();
        let record = store.get("task", "t-1").await.unwrap().unwrap();
        assert_eq!(record["title"], "Dishes");

        store.delete("task", "t-1").await.unwrap();
        assert!(store.get("task", "t-1").await.unwrap().is_none());
        assert_eq!(store.len("task").await, 0);
    }

    #[tokio::test]
    async fn test_query_filters_within_table() {
        let store = MemoryStore::new();
        store.put("task", "a", json!({"done": true})).await.unwrap();
        store.put("task", "b", json!({"done": false})).await.unwrap();
        store.put("reward", "c", json!({"done": true})).await.unwrap();

        let done = store
            .query("task", &|v: &Value| v["done"] == json!(true))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);

        let all = store.query("missing", &|_: &Value| true).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let store = MemoryStore::new();
        store.delete("task", "nope").await.unwrap();
    }
}
