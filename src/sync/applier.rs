//! Pushes queued mutations to the record server.

use async_trait::async_trait;
use famsync_core::{ApplyError, ApplyMode, EntityType, Mutation, Operation, Payload, RemoteApplier};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use super::client::{response_error, transport_error, RemoteClient, FORCE_OVERWRITE_HEADER};

/// Maps operations onto `POST`/`PUT`/`DELETE /records/{entity}/{id}`.
pub struct HttpApplier {
    client: RemoteClient,
}

impl HttpApplier {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

fn method_for(operation: Operation) -> Method {
    match operation {
        Operation::Insert => Method::POST,
        Operation::Update => Method::PUT,
        Operation::Delete => Method::DELETE,
    }
}

#[async_trait]
impl RemoteApplier for HttpApplier {
    async fn apply(&self, mutation: &Mutation, mode: ApplyMode) -> Result<(), ApplyError> {
        let url = self
            .client
            .record_url(&mutation.entity_type, &mutation.entity_id);
        let mut request = self.client.request(method_for(mutation.operation), &url);

        if mutation.operation != Operation::Delete {
            request = request.json(&mutation.payload);
        }
        if mode == ApplyMode::Force {
            request = request.header(FORCE_OVERWRITE_HEADER, "true");
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }
        // Deleting something already gone is done.
        if mutation.operation == Operation::Delete && status == StatusCode::NOT_FOUND {
            tracing::debug!(mutation_id = %mutation.id, "Record already deleted remotely");
            return Ok(());
        }

        Err(response_error(response).await)
    }

    async fn fetch_remote(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> Result<Option<Payload>, ApplyError> {
        let url = self.client.record_url(entity_type, entity_id);
        let response = self
            .client
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: Value = response.json().await.map_err(transport_error)?;
                Ok(body.as_object().cloned())
            }
            _ => Err(response_error(response).await),
        }
    }
}
