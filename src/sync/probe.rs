use async_trait::async_trait;
use famsync_core::{ProbeError, ReachabilityProbe};
use reqwest::Method;

use super::client::RemoteClient;

/// Reachability via a `GET /health` round trip to the record server.
pub struct HttpProbe {
    client: RemoteClient,
}

impl HttpProbe {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn round_trip(&self) -> Result<(), ProbeError> {
        let response = self
            .client
            .public(Method::GET, &self.client.health_url())
            .send()
            .await
            .map_err(|e| ProbeError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError(format!("health check returned {}", response.status())))
        }
    }
}
