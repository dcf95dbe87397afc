//! HTTP client for the family record server.

use famsync_core::{ApplyError, EntityType, Payload};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use super::SetupError;
use crate::config::SyncConfig;

/// Header asking the server to skip its version check.
pub const FORCE_OVERWRITE_HEADER: &str = "X-Force-Overwrite";

/// Connection to the record server, shared by the applier, reconciler and probe.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteClient {
    /// Creates a client from config.
    ///
    /// Returns an error if sync is not configured.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SetupError> {
        let server_url = config.server_url.clone().ok_or(SetupError::NotConfigured)?;
        let api_key = config.api_key.clone().ok_or(SetupError::NotConfigured)?;
        Ok(Self::new(server_url, api_key))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    pub(crate) fn collection_url(&self, entity_type: &EntityType) -> String {
        format!(
            "{}/records/{}",
            self.base_url,
            urlencoding::encode(entity_type.as_str())
        )
    }

    pub(crate) fn record_url(&self, entity_type: &EntityType, entity_id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(entity_type),
            urlencoding::encode(entity_id)
        )
    }

    /// Authenticated request builder.
    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.api_key)
    }

    /// Unauthenticated request builder.
    pub(crate) fn public(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url)
    }
}

/// Classifies a failure to get any response at all.
pub(crate) fn transport_error(e: reqwest::Error) -> ApplyError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        ApplyError::Transient(e.to_string())
    } else {
        ApplyError::Permanent(e.to_string())
    }
}

/// Classifies a non-success response. A 409 carries the server's current
/// record under `current`.
pub(crate) async fn response_error(response: Response) -> ApplyError {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if status == StatusCode::CONFLICT {
        let remote: Option<Payload> = body.get("current").and_then(Value::as_object).cloned();
        return ApplyError::Conflict { remote };
    }

    let message = body
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| status.canonical_reason())
        .unwrap_or("request failed")
        .to_string();
    ApplyError::from_status(status.as_u16(), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_encoded() {
        let client = RemoteClient::new("http://localhost:8080/", "key");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.health_url(), "http://localhost:8080/health");
        assert_eq!(
            client.record_url(&EntityType::TaskCompletion, "a b/c"),
            "http://localhost:8080/records/task_completion/a%20b%2Fc"
        );
    }

    #[test]
    fn test_from_config_requires_both_fields() {
        let partial = SyncConfig {
            server_url: Some("http://localhost:8080".into()),
            api_key: None,
        };
        assert!(matches!(
            RemoteClient::from_config(&partial),
            Err(SetupError::NotConfigured)
        ));
    }
}
