//! HTTP client for the ticketing provider's incident table
//!
//! Speaks the ServiceNow-style table API: records live under
//! `{base_url}/api/{api_version}/table/incident` and responses are wrapped in
//! a `{"result": ...}` envelope. The remediation idempotency key is stored in
//! the incident's `correlation_id` so a lost acknowledgement can be resolved
//! by looking the record up instead of creating it twice.

use super::IncidentSink;
use crate::error::RecordError;
use crate::models::{IncidentFields, IncidentRef};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Header carrying the idempotency key for backends that honour it
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Static incident fields applied to every remediation ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentTemplate {
    pub impact: String,
    pub urgency: String,
    pub priority: String,
    pub severity: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub assignment_group: Option<String>,
    pub caller_id: Option<String>,
}

impl Default for IncidentTemplate {
    fn default() -> Self {
        Self {
            impact: "3".to_string(),
            urgency: "3".to_string(),
            priority: "3".to_string(),
            severity: "2".to_string(),
            category: None,
            subcategory: None,
            assignment_group: None,
            caller_id: None,
        }
    }
}

/// Configuration for the ticketing client
#[derive(Debug, Clone)]
pub struct TicketingConfig {
    /// Instance URL, e.g. "https://dev12345.service-now.com"
    pub base_url: String,
    /// API namespace segment (default "now")
    pub api_version: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
    pub template: IncidentTemplate,
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_version: "now".to_string(),
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
            template: IncidentTemplate::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct IncidentPayload<'a> {
    short_description: &'a str,
    description: &'a str,
    correlation_id: &'a str,
    impact: &'a str,
    urgency: &'a str,
    priority: &'a str,
    severity: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subcategory: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assignment_group: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caller_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct IncidentRecord {
    sys_id: String,
    #[serde(default)]
    number: Option<String>,
}

impl From<IncidentRecord> for IncidentRef {
    fn from(record: IncidentRecord) -> Self {
        IncidentRef {
            id: record.sys_id,
            number: record.number,
        }
    }
}

/// Incident table client
pub struct TicketingClient {
    client: Client,
    table_url: String,
    username: Option<String>,
    password: Option<String>,
    template: IncidentTemplate,
}

impl TicketingClient {
    pub fn new(config: TicketingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(&config.base_url).context("Invalid ticketing URL")?;
        let table_url = format!(
            "{}/api/{}/table/incident",
            base_url.as_str().trim_end_matches('/'),
            config.api_version
        );

        Ok(Self {
            client,
            table_url,
            username: config.username,
            password: config.password,
            template: config.template,
        })
    }

    pub fn table_url(&self) -> &str {
        &self.table_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.username {
            Some(ref username) => request.basic_auth(username, self.password.as_ref()),
            None => request,
        }
    }
}

#[async_trait]
impl IncidentSink for TicketingClient {
    async fn create_incident(&self, fields: &IncidentFields) -> Result<IncidentRef, RecordError> {
        let payload = IncidentPayload {
            short_description: &fields.short_description,
            description: &fields.description,
            correlation_id: &fields.idempotency_key,
            impact: &self.template.impact,
            urgency: &self.template.urgency,
            priority: &self.template.priority,
            severity: &self.template.severity,
            category: self.template.category.as_deref(),
            subcategory: self.template.subcategory.as_deref(),
            assignment_group: self.template.assignment_group.as_deref(),
            caller_id: self.template.caller_id.as_deref(),
        };

        let request = self
            .client
            .post(&self.table_url)
            .header("Accept", "application/json")
            .header(IDEMPOTENCY_HEADER, &fields.idempotency_key)
            .json(&payload);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RecordError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_record_failure(status, &body));
        }

        // The record may be persisted even if the body cannot be read, so an
        // unreadable acknowledgement is retried through the key lookup
        let envelope: Envelope<IncidentRecord> = response
            .json()
            .await
            .map_err(|e| RecordError::Transient(format!("unreadable incident ack: {}", e)))?;

        debug!(
            instance_id = %fields.instance_id,
            sys_id = %envelope.result.sys_id,
            "Incident created"
        );
        Ok(envelope.result.into())
    }

    async fn find_incident(&self, idempotency_key: &str) -> Result<Option<IncidentRef>, RecordError> {
        let query = format!("correlation_id={}", idempotency_key);
        let request = self
            .client
            .get(&self.table_url)
            .header("Accept", "application/json")
            .query(&[
                ("sysparm_query", query.as_str()),
                ("sysparm_limit", "1"),
                ("sysparm_fields", "sys_id,number"),
            ]);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RecordError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_record_failure(status, &body));
        }

        let envelope: Envelope<Vec<IncidentRecord>> = response
            .json()
            .await
            .map_err(|e| RecordError::Transient(format!("unreadable lookup response: {}", e)))?;

        Ok(envelope.result.into_iter().next().map(IncidentRef::from))
    }
}

pub(crate) fn classify_record_failure(status: StatusCode, body: &str) -> RecordError {
    let detail = format!("ticketing error ({}): {}", status, body);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RecordError::Transient(detail),
        s if s.is_server_error() => RecordError::Transient(detail),
        _ => RecordError::RejectedByProvider(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn fields() -> IncidentFields {
        IncidentFields {
            idempotency_key: "abc123".to_string(),
            short_description: "EC2 Auto-Restart: i-1".to_string(),
            description: "Instance 'web-1' (i-1) restarted due to CPU=95.00% Memory=40.00%"
                .to_string(),
            instance_id: "i-1".to_string(),
        }
    }

    fn client_for(server: &mockito::ServerGuard) -> TicketingClient {
        TicketingClient::new(TicketingConfig {
            base_url: server.url(),
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            template: IncidentTemplate {
                assignment_group: Some("cloud-ops".to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_table_url() {
        let client = TicketingClient::new(TicketingConfig {
            base_url: "https://dev12345.service-now.com/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.table_url(),
            "https://dev12345.service-now.com/api/now/table/incident"
        );
    }

    #[tokio::test]
    async fn test_create_incident() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/now/table/incident")
            .match_header(IDEMPOTENCY_HEADER, "abc123")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::PartialJson(serde_json::json!({
                "short_description": "EC2 Auto-Restart: i-1",
                "correlation_id": "abc123",
                "severity": "2",
                "assignment_group": "cloud-ops"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result": {"sys_id": "9d385017c611228701d22104cc95c371", "number": "INC0010001"}}"#)
            .create_async()
            .await;

        let incident = client_for(&server).create_incident(&fields()).await.unwrap();
        mock.assert_async().await;

        assert_eq!(incident.id, "9d385017c611228701d22104cc95c371");
        assert_eq!(incident.number.as_deref(), Some("INC0010001"));
    }

    #[tokio::test]
    async fn test_create_incident_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/now/table/incident")
            .with_status(400)
            .with_body(r#"{"error": {"message": "Invalid payload"}}"#)
            .create_async()
            .await;

        let result = client_for(&server).create_incident(&fields()).await;
        assert!(matches!(result, Err(RecordError::RejectedByProvider(_))));
    }

    #[tokio::test]
    async fn test_create_incident_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/now/table/incident")
            .with_status(503)
            .create_async()
            .await;

        let result = client_for(&server).create_incident(&fields()).await;
        assert!(matches!(result, Err(RecordError::Transient(_))));
    }

    #[tokio::test]
    async fn test_find_incident_by_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/now/table/incident")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("sysparm_query".into(), "correlation_id=abc123".into()),
                Matcher::UrlEncoded("sysparm_limit".into(), "1".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result": [{"sys_id": "s-1", "number": "INC0010001"}]}"#)
            .create_async()
            .await;

        let found = client_for(&server).find_incident("abc123").await.unwrap();
        mock.assert_async().await;

        assert_eq!(
            found,
            Some(IncidentRef {
                id: "s-1".to_string(),
                number: Some("INC0010001".to_string())
            })
        );
    }

    #[tokio::test]
    async fn test_find_incident_absent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/now/table/incident")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result": []}"#)
            .create_async()
            .await;

        let found = client_for(&server).find_incident("abc123").await.unwrap();
        assert!(found.is_none());
    }
}
