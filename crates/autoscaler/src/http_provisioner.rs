//! Provisioner adapter for the fleet provisioning HTTP API

use anyhow::Context;
use async_trait::async_trait;
use autoscaler_lib::{InstanceTypeProfile, ProvisionError, Provisioner};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Where and for whom instances are launched
#[derive(Debug, Clone, Serialize)]
pub struct LaunchScope {
    pub region: String,
    pub account: String,
    pub cluster_id: String,
}

#[derive(Debug, Serialize)]
struct LaunchRequest<'a> {
    instance_type: &'a str,
    count: u32,
    #[serde(flatten)]
    scope: &'a LaunchScope,
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceTypeList {
    instance_types: Vec<InstanceTypeProfile>,
}

/// HTTP client for the provisioning API
pub struct HttpProvisioner {
    client: Client,
    base_url: Url,
    scope: LaunchScope,
    timeout: Duration,
}

impl HttpProvisioner {
    pub fn new(base_url: &str, scope: LaunchScope, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid provisioner URL")?;

        Ok(Self {
            client,
            base_url,
            scope,
            timeout,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ProvisionError> {
        self.base_url
            .join(path)
            .map_err(|e| ProvisionError::Rejected(format!("invalid path {path}: {e}")))
    }

    /// Only a failed connect proves the request never reached the API. Any
    /// other transport failure on a non-idempotent call is unconfirmed.
    fn transport_error(
        &self,
        operation: &'static str,
        idempotent: bool,
        e: reqwest::Error,
    ) -> ProvisionError {
        if e.is_timeout() {
            ProvisionError::Timeout {
                operation,
                timeout: self.timeout,
            }
        } else if idempotent || e.is_connect() {
            ProvisionError::Unavailable(e.to_string())
        } else {
            ProvisionError::Unconfirmed(format!("{operation}: {e}"))
        }
    }

    /// 5xx and 429 are retryable; any other non-success status is final
    async fn check(response: Response) -> Result<Response, ProvisionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("API error ({}): {}", status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(ProvisionError::Unavailable(message))
        } else {
            Err(ProvisionError::Rejected(message))
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn launch(&self, instance_type: &str, count: u32) -> Result<Vec<String>, ProvisionError> {
        let request = LaunchRequest {
            instance_type,
            count,
            scope: &self.scope,
        };
        let response = self
            .client
            .post(self.url("v1/instances")?)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error("launch", false, e))?;

        let launched: LaunchResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProvisionError::Unconfirmed(format!("invalid launch response: {e}")))?;

        if launched.instance_ids.len() != count as usize {
            warn!(
                instance_type = %instance_type,
                requested = count,
                granted = launched.instance_ids.len(),
                "Provisioner granted a different instance count"
            );
        }
        Ok(launched.instance_ids)
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ProvisionError> {
        let response = self
            .client
            .delete(self.url(&format!("v1/instances/{instance_id}"))?)
            .send()
            .await
            .map_err(|e| self.transport_error("terminate", true, e))?;

        // Already gone counts as terminated
        if response.status() == StatusCode::NOT_FOUND {
            debug!(instance_id = %instance_id, "Instance already terminated");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn describe_instance_types(&self) -> Result<Vec<InstanceTypeProfile>, ProvisionError> {
        let response = self
            .client
            .get(self.url("v1/instance-types")?)
            .send()
            .await
            .map_err(|e| self.transport_error("describe_instance_types", true, e))?;

        let list: InstanceTypeList = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProvisionError::Unavailable(format!("invalid catalog response: {e}")))?;
        Ok(list.instance_types)
    }
}
