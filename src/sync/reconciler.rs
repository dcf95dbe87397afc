//! Pull-based refresh of local records from the record server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use famsync_core::store::LocalStore;
use famsync_core::{ApplyError, EntityType, ReconcileReport, Reconciler};
use futures::future::try_join_all;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use super::client::{response_error, transport_error, RemoteClient};

#[derive(Debug, Deserialize)]
struct RecordList {
    records: Vec<Value>,
}

/// Fetches `GET /records/{entity}?since=` for every entity type and writes
/// the results into the local store.
pub struct HttpReconciler {
    client: RemoteClient,
    entity_types: Vec<EntityType>,
}

impl HttpReconciler {
    pub fn new(client: RemoteClient) -> Self {
        Self {
            client,
            entity_types: EntityType::known().to_vec(),
        }
    }

    async fn fetch(
        &self,
        entity_type: &EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, ApplyError> {
        let mut url = self.client.collection_url(entity_type);
        if let Some(since) = since {
            url = format!("{}?since={}", url, urlencoding::encode(&since.to_rfc3339()));
        }

        let response = self
            .client
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(response_error(response).await);
        }

        let list: RecordList = response.json().await.map_err(transport_error)?;
        Ok(list.records)
    }
}

#[async_trait]
impl Reconciler for HttpReconciler {
    async fn reconcile(
        &self,
        store: &dyn LocalStore,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReconcileReport, ApplyError> {
        let batches = try_join_all(self.entity_types.iter().map(|t| self.fetch(t, since))).await?;

        let mut records_updated = 0;
        for (entity_type, records) in self.entity_types.iter().zip(batches) {
            for record in records {
                let Some(id) = record_id(&record) else {
                    tracing::warn!(entity_type = %entity_type, "Skipping remote record without id");
                    continue;
                };
                store
                    .put(entity_type.as_str(), &id, record)
                    .await
                    .map_err(|e| ApplyError::Permanent(e.to_string()))?;
                records_updated += 1;
            }
        }

        tracing::debug!(records_updated, "Pulled remote records");
        Ok(ReconcileReport { records_updated })
    }
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&json!({"id": "t1"})), Some("t1".to_string()));
        assert_eq!(record_id(&json!({"id": 7})), Some("7".to_string()));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"title": "x"})), None);
    }
}
