//! SQLite-backed [`LocalStore`].
//!
//! Every logical table lives in one `records` table keyed by `(tbl, key)`,
//! with the record serialized as JSON text.

use async_trait::async_trait;
use chrono::Utc;
use famsync_core::store::{LocalStore, RecordFilter};
use famsync_core::StoreError;
use serde_json::Value;
use sqlx::SqlitePool;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of records in a table.
    pub async fn count(&self, table: &str) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records WHERE tbl = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(count)
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn put(&self, table: &str, key: &str, record: Value) -> Result<(), StoreError> {
        let data = serde_json::to_string(&record)?;
        let updated_at = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO records (tbl, key, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tbl, key) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(table)
        .bind(key)
        .bind(&data)
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT data FROM records WHERE tbl = ? AND key = ?")
                .bind(table)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;

        match row {
            Some((data,)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn query(&self, table: &str, filter: RecordFilter<'_>) -> Result<Vec<Value>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT data FROM records WHERE tbl = ? ORDER BY key")
                .bind(table)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

        let mut records = Vec::with_capacity(rows.len());
        for (data,) in rows {
            let record: Value = serde_json::from_str(&data)?;
            if filter(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM records WHERE tbl = ? AND key = ?")
            .bind(table)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use famsync_core::{
        ApplierRegistry, ApplyError, ApplyMode, ConnectivityMonitor, EntityType, Mutation,
        MutationStatus, Operation, RemoteApplier, SyncEngine,
    };
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup() -> (SqliteStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_db(&temp_dir.path().join("test.db")).await.unwrap();
        (SqliteStore::new(pool), temp_dir)
    }

    #[tokio::test]
    async fn test_put_get_overwrite_delete() {
        let (store, _temp) = setup().await;

        store
            .put("task", "t1", json!({"id": "t1", "title": "Feed the cat"}))
            .await
            .unwrap();
        store
            .put("task", "t1", json!({"id": "t1", "title": "Feed the dog"}))
            .await
            .unwrap();

        let record = store.get("task", "t1").await.unwrap().unwrap();
        assert_eq!(record["title"], "Feed the dog");
        assert_eq!(store.count("task").await.unwrap(), 1);

        store.delete("task", "t1").await.unwrap();
        assert!(store.get("task", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let (store, _temp) = setup().await;

        store.put("task", "1", json!({"id": "1"})).await.unwrap();
        store.put("user", "1", json!({"id": "1", "name": "Sam"})).await.unwrap();

        assert_eq!(store.count("task").await.unwrap(), 1);
        assert_eq!(store.get("user", "1").await.unwrap().unwrap()["name"], "Sam");
        assert!(store.get("redemption", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_applies_filter() {
        let (store, _temp) = setup().await;

        for (id, points) in [("r1", 10), ("r2", 50), ("r3", 80)] {
            store
                .put("redemption", id, json!({"id": id, "points": points}))
                .await
                .unwrap();
        }

        let big = store
            .query("redemption", &|r: &Value| r["points"].as_i64().unwrap_or(0) >= 50)
            .await
            .unwrap();
        let ids: Vec<&str> = big.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3"]);
    }

    struct Unreachable;

    #[async_trait]
    impl RemoteApplier for Unreachable {
        async fn apply(&self, _: &Mutation, _: ApplyMode) -> Result<(), ApplyError> {
            Err(ApplyError::Transient("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("famsync.db");

        let build = |store: Arc<SqliteStore>| async move {
            SyncEngine::builder(store, Arc::new(ConnectivityMonitor::manual()))
                .registry(ApplierRegistry::new().with_fallback(Arc::new(Unreachable)))
                .build()
                .await
                .unwrap()
        };

        let id = {
            let store = Arc::new(SqliteStore::new(init_db(&db_path).await.unwrap()));
            let engine = build(store).await;
            engine
                .enqueue_mutation(
                    EntityType::TaskCompletion,
                    Operation::Insert,
                    json!({"id": "c1", "task_id": "t1"}).as_object().cloned().unwrap(),
                )
                .await
                .unwrap()
        };

        let store = Arc::new(SqliteStore::new(init_db(&db_path).await.unwrap()));
        let engine = build(store).await;

        assert_eq!(engine.pending_count().await, 1);
        let m = engine.get_mutation(&id).await.unwrap();
        assert_eq!(m.status, MutationStatus::Pending);
        assert_eq!(m.payload["task_id"], "t1");
    }
}
