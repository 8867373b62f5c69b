//! HTTP client for the instance gateway
//!
//! The gateway fronts the cloud provider's instance and monitoring APIs:
//! - `GET  /ec2/list` returns the instance inventory
//! - `GET  /cloudwatch/metrics?instance_id=...` returns average CPU/memory
//! - `POST /ec2/restart` reboots an instance

use super::{ActionProvider, InventorySource, MetricsSource};
use crate::error::{ActionError, InventoryError, MetricsError};
use crate::models::{Ack, Instance, LifecycleState, UtilizationSample};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Configuration for the gateway client
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, e.g. "http://aws-gateway:8000"
    pub base_url: String,
    /// Transport-level request timeout
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewayInstance {
    instance_id: String,
    state: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    instance_type: Option<String>,
    #[serde(default)]
    az: Option<String>,
}

impl From<GatewayInstance> for Instance {
    fn from(raw: GatewayInstance) -> Self {
        Instance {
            lifecycle_state: LifecycleState::from_provider(&raw.state),
            id: raw.instance_id,
            display_name: raw.name,
            instance_type: raw.instance_type,
            availability_zone: raw.az,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GatewayMetrics {
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    memory: Option<f64>,
}

#[derive(Debug, Serialize)]
struct RestartRequest<'a> {
    instance_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RestartResponse {
    #[serde(default)]
    status: Option<String>,
}

/// Gateway client implementing inventory, metrics and restart
pub struct GatewayClient {
    client: Client,
    base_url: Url,
}

impl GatewayClient {
    /// Create a new gateway client
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(&config.base_url).context("Invalid gateway URL")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }
}

#[async_trait]
impl InventorySource for GatewayClient {
    async fn list_instances(&self) -> Result<Vec<Instance>, InventoryError> {
        let response = self
            .client
            .get(self.endpoint("/ec2/list"))
            .send()
            .await
            .map_err(|e| InventoryError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InventoryError::ProviderUnavailable(format!(
                "gateway error ({}): {}",
                status, body
            )));
        }

        // Decode the whole list before returning so a truncated body never
        // yields a partial fleet
        let raw: Vec<GatewayInstance> = response
            .json()
            .await
            .map_err(|e| InventoryError::ProviderUnavailable(format!("invalid inventory: {}", e)))?;

        debug!(instances = raw.len(), "Fetched inventory");
        Ok(raw.into_iter().map(Instance::from).collect())
    }
}

#[async_trait]
impl MetricsSource for GatewayClient {
    async fn get_metrics(&self, instance_id: &str) -> Result<UtilizationSample, MetricsError> {
        let response = self
            .client
            .get(self.endpoint("/cloudwatch/metrics"))
            .query(&[("instance_id", instance_id)])
            .send()
            .await
            .map_err(|e| MetricsError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MetricsError::Unavailable(format!(
                "gateway error ({}): {}",
                status, body
            )));
        }

        let raw: GatewayMetrics = response
            .json()
            .await
            .map_err(|e| MetricsError::Malformed(e.to_string()))?;

        Ok(match (raw.cpu, raw.memory) {
            (None, None) => UtilizationSample::no_datapoints(instance_id),
            // Memory needs the in-guest agent; treat a missing value as zero
            (cpu, memory) => UtilizationSample::new(
                instance_id,
                clamp_percent(cpu.unwrap_or(0.0)),
                clamp_percent(memory.unwrap_or(0.0)),
            ),
        })
    }
}

#[async_trait]
impl ActionProvider for GatewayClient {
    async fn restart(&self, instance_id: &str) -> Result<Ack, ActionError> {
        let response = self
            .client
            .post(self.endpoint("/ec2/restart"))
            .json(&RestartRequest { instance_id })
            .send()
            .await
            .map_err(|e| ActionError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_restart_failure(status, &body));
        }

        // The reboot was accepted; an unreadable body must not trigger a second one
        let ack: RestartResponse = response
            .json()
            .await
            .unwrap_or(RestartResponse { status: None });

        Ok(Ack {
            instance_id: instance_id.to_string(),
            status: ack.status.unwrap_or_else(|| "restarted".to_string()),
        })
    }
}

/// Map a failed restart response onto the action error taxonomy.
///
/// The gateway reports provider exceptions as 500 with the provider's error
/// code in the body, so the body is inspected before the status class.
pub(crate) fn classify_restart_failure(status: StatusCode, body: &str) -> ActionError {
    let detail = format!("gateway error ({}): {}", status, body);

    if body.contains("InvalidInstanceID") {
        return ActionError::NotFound(detail);
    }
    if body.contains("UnauthorizedOperation") || body.contains("AccessDenied") {
        return ActionError::PermissionDenied(detail);
    }

    match status {
        StatusCode::NOT_FOUND => ActionError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ActionError::PermissionDenied(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ActionError::Transient(detail)
        }
        s if s.is_server_error() => ActionError::Transient(detail),
        _ => ActionError::Rejected(detail),
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::ServerGuard) -> GatewayClient {
        GatewayClient::new(GatewayConfig {
            base_url: server.url(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_base_url() {
        let result = GatewayClient::new(GatewayConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_instances() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ec2/list")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"[
                    {"instance_id": "i-1", "state": "running", "name": "web-1", "type": "t3.micro", "az": "us-east-1a"},
                    {"instance_id": "i-2", "state": "stopped"},
                    {"instance_id": "i-3", "state": "pending", "name": null}
                ]"#,
            )
            .create_async()
            .await;

        let instances = client_for(&server).list_instances().await.unwrap();
        mock.assert_async().await;

        assert_eq!(instances.len(), 3);
        assert_eq!(instances[0].id, "i-1");
        assert_eq!(instances[0].name(), "web-1");
        assert!(instances[0].is_running());
        assert_eq!(instances[0].instance_type.as_deref(), Some("t3.micro"));
        assert_eq!(instances[1].lifecycle_state, LifecycleState::Stopped);
        assert_eq!(instances[2].lifecycle_state, LifecycleState::Other);
        assert_eq!(instances[2].name(), "i-3");
    }

    #[tokio::test]
    async fn test_list_instances_server_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ec2/list")
            .with_status(502)
            .create_async()
            .await;

        let result = client_for(&server).list_instances().await;
        assert!(matches!(result, Err(InventoryError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_list_instances_truncated_body_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ec2/list")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"instance_id": "i-1", "state": "running"}, {"instance_"#)
            .create_async()
            .await;

        let result = client_for(&server).list_instances().await;
        assert!(matches!(result, Err(InventoryError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_get_metrics() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cloudwatch/metrics")
            .match_query(Matcher::UrlEncoded("instance_id".into(), "i-1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"instance_id": "i-1", "cpu": 95.5, "memory": 40.25}"#)
            .create_async()
            .await;

        let sample = client_for(&server).get_metrics("i-1").await.unwrap();
        mock.assert_async().await;

        assert_eq!(sample.instance_id, "i-1");
        assert_eq!(sample.cpu_percent, 95.5);
        assert_eq!(sample.memory_percent, 40.25);
        assert!(!sample.insufficient_data);
    }

    #[tokio::test]
    async fn test_get_metrics_without_datapoints() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cloudwatch/metrics")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"instance_id": "i-1", "cpu": null}"#)
            .create_async()
            .await;

        let sample = client_for(&server).get_metrics("i-1").await.unwrap();
        assert!(sample.insufficient_data);
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_percent, 0.0);
    }

    #[tokio::test]
    async fn test_get_metrics_missing_memory_is_zero() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cloudwatch/metrics")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"instance_id": "i-1", "cpu": 97.0}"#)
            .create_async()
            .await;

        let sample = client_for(&server).get_metrics("i-1").await.unwrap();
        assert!(!sample.insufficient_data);
        assert_eq!(sample.cpu_percent, 97.0);
        assert_eq!(sample.memory_percent, 0.0);
    }

    #[tokio::test]
    async fn test_restart_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ec2/restart")
            .match_body(Matcher::Json(serde_json::json!({"instance_id": "i-1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "restarted", "instance_id": "i-1"}"#)
            .create_async()
            .await;

        let ack = client_for(&server).restart("i-1").await.unwrap();
        mock.assert_async().await;

        assert_eq!(ack.instance_id, "i-1");
        assert_eq!(ack.status, "restarted");
    }

    #[tokio::test]
    async fn test_restart_accepted_with_unreadable_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ec2/restart")
            .with_status(200)
            .with_body("OK")
            .expect(1)
            .create_async()
            .await;

        let ack = client_for(&server).restart("i-1").await.unwrap();
        mock.assert_async().await;

        assert_eq!(ack.status, "restarted");
    }

    #[tokio::test]
    async fn test_restart_provider_exception_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ec2/restart")
            .with_status(500)
            .with_body(r#"{"detail": "An error occurred (InvalidInstanceID.NotFound)"}"#)
            .create_async()
            .await;

        let result = client_for(&server).restart("i-missing").await;
        assert!(matches!(result, Err(ActionError::NotFound(_))));
    }

    #[test]
    fn test_classify_restart_failure() {
        assert!(matches!(
            classify_restart_failure(StatusCode::SERVICE_UNAVAILABLE, ""),
            ActionError::Transient(_)
        ));
        assert!(matches!(
            classify_restart_failure(StatusCode::FORBIDDEN, ""),
            ActionError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_restart_failure(StatusCode::INTERNAL_SERVER_ERROR, "UnauthorizedOperation"),
            ActionError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_restart_failure(StatusCode::NOT_FOUND, ""),
            ActionError::NotFound(_)
        ));
        assert!(matches!(
            classify_restart_failure(StatusCode::BAD_REQUEST, "instance_id is required"),
            ActionError::Rejected(_)
        ));
        assert!(matches!(
            classify_restart_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            ActionError::Transient(_)
        ));
    }

    #[test]
    fn test_clamp_percent() {
        assert_eq!(clamp_percent(150.0), 100.0);
        assert_eq!(clamp_percent(-1.0), 0.0);
        assert_eq!(clamp_percent(f64::NAN), 0.0);
    }
}
