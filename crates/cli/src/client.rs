//! API client for the fleet autoscaler's HTTP endpoints

use anyhow::{Context, Result};
use autoscaler_lib::{HealthResponse, ReadinessResponse, ScalerStatus};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// API client for a running autoscaler
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request. `accept_unavailable` also decodes 503 bodies, which
    /// the probe endpoints use to report what is wrong.
    async fn fetch<T: DeserializeOwned>(&self, path: &str, accept_unavailable: bool) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let decodable =
            status.is_success() || (accept_unavailable && status == StatusCode::SERVICE_UNAVAILABLE);
        if !decodable {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Latest status summary published by the reconciliation loop
    pub async fn status(&self) -> Result<ScalerStatus> {
        self.fetch("status", false).await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.fetch("healthz", true).await
    }

    pub async fn readiness(&self) -> Result<ReadinessResponse> {
        self.fetch("readyz", true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_lib::ComponentStatus;

    #[tokio::test]
    async fn test_status_decodes_summary() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/status")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "cluster_id": "prod",
                    "policy": "idle-based",
                    "last_tick_at": "2024-03-01T10:00:00Z",
                    "last_error": null,
                    "nodes": {
                        "node-a": {
                            "state": "evicting",
                            "instance_id": "i-a",
                            "instance_type": "m5.xlarge",
                            "reason": "idle for 900s",
                            "started_at": "2024-03-01T09:58:00Z",
                            "since": "2024-03-01T09:59:00Z",
                            "blocked_pods": ["data/db-0"]
                        }
                    },
                    "fleet_size": 3
                }"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(status.cluster_id, "prod");
        assert_eq!(status.fleet_size, 3);
        assert_eq!(status.nodes["node-a"].blocked_pods, vec!["data/db-0"]);
    }

    #[tokio::test]
    async fn test_health_decodes_unavailable_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status": "unhealthy", "components": {"snapshot": {"status": "unhealthy", "message": "orchestrator unreachable", "last_check_timestamp": 0}}}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let health = client.health().await.unwrap();
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components["snapshot"].message.as_deref(),
            Some("orchestrator unreachable")
        );
    }

    #[tokio::test]
    async fn test_status_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/status")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.status().await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
