//! OCM clusters_mgmt client for the identity exchange.
//!
//! The agent proxies requests keyed by the cluster's OCM-internal ID, while the
//! cluster itself only knows its external ID. The exchange is a cluster search
//! against the upstream API with the agent's own access token.

use crate::discovery::ClusterEndpointConfig;
use crate::error::sanitize_error_body;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("OCM API returned status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("no cluster with external ID {0} is registered in OCM")]
    ClusterNotFound(String),

    #[error("{count} clusters match external ID {external_id}")]
    Ambiguous { external_id: String, count: usize },

    #[error("Invalid OCM API response: {0}")]
    InvalidResponse(String),
}

/// Translates an external cluster ID into the OCM-internal one.
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    async fn internal_id(&self, endpoint: &ClusterEndpointConfig)
        -> Result<String, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct ClusterList {
    #[serde(default)]
    items: Vec<ClusterItem>,
}

#[derive(Debug, Deserialize)]
struct ClusterItem {
    id: String,
}

/// [`IdentityExchange`] over the OCM REST API.
#[derive(Debug, Clone)]
pub struct OcmApiClient {
    http_client: Client,
}

impl OcmApiClient {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl IdentityExchange for OcmApiClient {
    async fn internal_id(
        &self,
        endpoint: &ClusterEndpointConfig,
    ) -> Result<String, UpstreamError> {
        let url = format!(
            "{}/api/clusters_mgmt/v1/clusters",
            endpoint.ocm_base_url.trim_end_matches('/')
        );
        let search = format!("external_id = '{}'", endpoint.external_id);

        debug!(
            target: "ocm_e2e.ocm_api",
            external_id = %endpoint.external_id,
            "Looking up internal cluster ID"
        );

        let response = self
            .http_client
            .get(&url)
            .query(&[("search", search.as_str())])
            .bearer_auth(endpoint.access_token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::RequestFailed {
                status: status.as_u16(),
                body: sanitize_error_body(&body),
            });
        }

        let list: ClusterList = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?;

        let mut items = list.items.into_iter();
        match (items.next(), items.len()) {
            (None, _) => Err(UpstreamError::ClusterNotFound(
                endpoint.external_id.clone(),
            )),
            (Some(cluster), 0) if !cluster.id.is_empty() => Ok(cluster.id),
            (Some(_), 0) => Err(UpstreamError::InvalidResponse(
                "cluster item has an empty id".to_string(),
            )),
            (Some(_), rest) => Err(UpstreamError::Ambiguous {
                external_id: endpoint.external_id.clone(),
                count: rest + 1,
            }),
        }
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
    use crate::discovery::{AgentSettings, IdSource};
    use secrecy::SecretString;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(base_url: &str) -> ClusterEndpointConfig {
        ClusterEndpointConfig::new(
            AgentSettings {
                external_id: "ext-123".to_string(),
                id_source: IdSource::ConfigMap,
                ocm_base_url: base_url.to_string(),
                services: "clusters".to_string(),
            },
            SecretString::from("ocm-token"),
        )
    }

    fn client() -> OcmApiClient {
        OcmApiClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_internal_id_resolved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/clusters_mgmt/v1/clusters"))
            .and(query_param("search", "external_id = 'ext-123'"))
            .and(header("Authorization", "Bearer ocm-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "ClusterList",
                "total": 1,
                "items": [{ "id": "internal-abc", "external_id": "ext-123" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let id = client().internal_id(&endpoint(&server.uri())).await.unwrap();
        assert_eq!(id, "internal-abc");
    }

    #[tokio::test]
    async fn test_unregistered_cluster() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/clusters_mgmt/v1/clusters"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "kind": "ClusterList", "items": [] })),
            )
            .mount(&server)
            .await;

        let err = client()
            .internal_id(&endpoint(&server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ClusterNotFound(id) if id == "ext-123"));
    }

    #[tokio::test]
    async fn test_ambiguous_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/clusters_mgmt/v1/clusters"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "id": "a" }, { "id": "b" }]
            })))
            .mount(&server)
            .await;

        let err = client()
            .internal_id(&endpoint(&server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Ambiguous { count: 2, .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_body_is_sanitized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/clusters_mgmt/v1/clusters"))
            .respond_with(
                ResponseTemplate::new(401).set_body_string("invalid token Bearer abc.def.ghi"),
            )
            .mount(&server)
            .await;

        let err = client()
            .internal_id(&endpoint(&server.uri()))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("401"));
        assert!(!message.contains("abc.def.ghi"));
    }

    #[tokio::test]
    async fn test_unreachable_api() {
        let err = client()
            .internal_id(&endpoint("http://127.0.0.1:9"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::HttpError(_)));
    }
}
