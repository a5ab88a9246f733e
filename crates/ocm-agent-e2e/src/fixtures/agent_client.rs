//! HTTP client for the agent's forwarded endpoints.
//!
//! Requests return the raw status and body instead of failing on non-2xx, since
//! most proxy probes accept a set of statuses. Only the liveness check used
//! while waiting for the port-forward turns a non-200 into an error.

use crate::error::sanitize_error_body;
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Endpoint paths served by the agent.
pub mod paths {
    pub const LIVEZ: &str = "/livez";
    pub const READYZ: &str = "/readyz";
    pub const METRICS: &str = "/metrics";

    /// A path the agent does not serve.
    pub const INVALID: &str = "/invalid-endpoint";

    pub fn cluster(internal_id: &str) -> String {
        format!("/api/clusters_mgmt/v1/clusters/{internal_id}")
    }

    pub fn upgrade_policies(internal_id: &str) -> String {
        format!("{}/upgrade_policies", cluster(internal_id))
    }

    pub fn upgrade_policy(internal_id: &str, policy_id: &str) -> String {
        format!("{}/{policy_id}", upgrade_policies(internal_id))
    }

    pub fn upgrade_policy_state(internal_id: &str, policy_id: &str) -> String {
        format!("{}/state", upgrade_policy(internal_id, policy_id))
    }

    pub fn limited_support_reasons(internal_id: &str) -> String {
        format!("{}/limited_support_reasons", cluster(internal_id))
    }

    pub fn limited_support_reason(internal_id: &str, reason_id: &str) -> String {
        format!("{}/{reason_id}", limited_support_reasons(internal_id))
    }
}

#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("{path} returned status {status}: {body}")]
    UnexpectedStatus {
        path: String,
        status: u16,
        body: String,
    },
}

impl AgentClientError {
    /// True when no HTTP response was received at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::HttpError(_))
    }
}

/// Status and body of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Which forwarded port a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Service,
    Metrics,
}

/// Client for the forwarded agent HTTP and metrics ports.
#[derive(Debug, Clone)]
pub struct AgentClient {
    base_url: String,
    metrics_base_url: String,
    http_client: Client,
}

impl AgentClient {
    /// Create a client whose requests time out after `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        metrics_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AgentClientError> {
        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: base_url.into(),
            metrics_base_url: metrics_base_url.into(),
            http_client,
        })
    }

    /// Same endpoints, different timeout budget.
    pub fn with_timeout(&self, timeout: Duration) -> Result<Self, AgentClientError> {
        Self::new(self.base_url.clone(), self.metrics_base_url.clone(), timeout)
    }

    /// Send a request and return whatever the agent answered.
    pub async fn send(
        &self,
        method: Method,
        port: Port,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpReply, AgentClientError> {
        let base = match port {
            Port::Service => &self.base_url,
            Port::Metrics => &self.metrics_base_url,
        };
        let url = format!("{base}{path}");

        let mut request = self.http_client.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(HttpReply { status, body })
    }

    /// `GET` on the service port.
    pub async fn get(&self, path: &str) -> Result<HttpReply, AgentClientError> {
        self.send(Method::GET, Port::Service, path, None).await
    }

    /// `GET /livez` must answer 200.
    pub async fn check_live(&self) -> Result<(), AgentClientError> {
        let reply = self.get(paths::LIVEZ).await?;
        if reply.status != 200 {
            return Err(AgentClientError::UnexpectedStatus {
                path: paths::LIVEZ.to_string(),
                status: reply.status,
                body: sanitize_error_body(&reply.body),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AgentClient {
        AgentClient::new(server.uri(), server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_proxy_paths() {
        assert_eq!(
            paths::upgrade_policies("int-1"),
            "/api/clusters_mgmt/v1/clusters/int-1/upgrade_policies"
        );
        assert_eq!(
            paths::upgrade_policy_state("int-1", "pol-9"),
            "/api/clusters_mgmt/v1/clusters/int-1/upgrade_policies/pol-9/state"
        );
        assert_eq!(
            paths::limited_support_reason("int-1", "lsr-2"),
            "/api/clusters_mgmt/v1/clusters/int-1/limited_support_reasons/lsr-2"
        );
    }

    #[tokio::test]
    async fn test_check_live_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/livez"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).check_live().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_live_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/livez"))
            .respond_with(ResponseTemplate::new(503).set_body_string("not live"))
            .mount(&server)
            .await;

        let err = client(&server).check_live().await.unwrap_err();

        assert!(!err.is_transport());
        assert!(matches!(
            err,
            AgentClientError::UnexpectedStatus { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_get_returns_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invalid-endpoint"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let reply = client(&server).get(paths::INVALID).await.unwrap();
        assert_eq!(reply.status, 404);
    }

    #[tokio::test]
    async fn test_patch_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/clusters_mgmt/v1/clusters/int-1/upgrade_policies/p/state"))
            .and(body_json(serde_json::json!({ "value": "scheduled" })))
            .respond_with(ResponseTemplate::new(405))
            .expect(1)
            .mount(&server)
            .await;

        let reply = client(&server)
            .send(
                Method::PATCH,
                Port::Service,
                &paths::upgrade_policy_state("int-1", "p"),
                Some(&serde_json::json!({ "value": "scheduled" })),
            )
            .await
            .unwrap();

        assert_eq!(reply.status, 405);
    }

    #[tokio::test]
    async fn test_connection_error_is_transport() {
        // Nothing listens on port 9 (discard) in the test environment.
        let client =
            AgentClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", Duration::from_secs(2))
                .unwrap();

        let err = client.check_live().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_reply_json() {
        let reply = HttpReply {
            status: 200,
            body: r#"{"items":[{"id":"p1"}]}"#.to_string(),
        };
        assert_eq!(reply.json().unwrap()["items"][0]["id"], "p1");

        let text = HttpReply {
            status: 200,
            body: "ok".to_string(),
        };
        assert!(text.json().is_none());
    }
}
