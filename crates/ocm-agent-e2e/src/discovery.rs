//! Connection parameter discovery.
//!
//! The agent's ConfigMap is the primary source of the external cluster ID. On
//! clusters where the operator left it blank, the ID is taken from the
//! ClusterVersion object, then from the Infrastructure object. The chain is an
//! ordered list of [`IdSource`] values; the first non-empty answer wins and no
//! later source is consulted.

use crate::cluster::ClusterReader;
use crate::config::{keys, HarnessConfig};
use crate::error::HarnessError;
use secrecy::SecretString;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

/// Where an external cluster ID can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    /// `clusterID` key of the agent ConfigMap.
    ConfigMap,
    /// `spec.clusterID` of ClusterVersion `version`.
    ClusterVersion,
    /// `status.infrastructureName` of Infrastructure `cluster`.
    Infrastructure,
}

impl IdSource {
    /// Resolution order: ConfigMap, ClusterVersion, Infrastructure.
    pub const DEFAULT_CHAIN: [IdSource; 3] = [
        IdSource::ConfigMap,
        IdSource::ClusterVersion,
        IdSource::Infrastructure,
    ];

    /// Ask this source for an ID. Read failures count as "no answer" so the
    /// chain can move on.
    async fn resolve(
        &self,
        cluster: &dyn ClusterReader,
        configmap: &BTreeMap<String, String>,
    ) -> Option<String> {
        let value = match self {
            IdSource::ConfigMap => Ok(configmap.get(keys::CLUSTER_ID).cloned()),
            IdSource::ClusterVersion => cluster.cluster_version_id().await,
            IdSource::Infrastructure => cluster.infrastructure_name().await,
        };

        match value {
            Ok(id) => id.filter(|id| !id.is_empty()),
            Err(e) => {
                debug!(
                    target: "ocm_e2e.discovery",
                    source = %self,
                    error = %e,
                    "Cluster ID source unavailable"
                );
                None
            }
        }
    }
}

impl fmt::Display for IdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdSource::ConfigMap => "configmap",
            IdSource::ClusterVersion => "clusterversion",
            IdSource::Infrastructure => "infrastructure",
        };
        f.write_str(name)
    }
}

/// Try each source in order and return the first non-empty ID.
pub async fn resolve_external_id(
    chain: &[IdSource],
    cluster: &dyn ClusterReader,
    configmap: &BTreeMap<String, String>,
) -> Option<(IdSource, String)> {
    for source in chain {
        if let Some(id) = source.resolve(cluster, configmap).await {
            return Some((*source, id));
        }
    }
    None
}

/// Agent settings read from the cluster, before the credential is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub external_id: String,
    pub id_source: IdSource,
    pub ocm_base_url: String,
    pub services: String,
}

/// Everything needed to talk to OCM on behalf of this cluster.
#[derive(Debug, Clone)]
pub struct ClusterEndpointConfig {
    pub external_id: String,
    pub id_source: IdSource,
    /// Filled in by the identity exchange; `None` until then or if it failed.
    pub internal_id: Option<String>,
    pub ocm_base_url: String,
    pub services: String,
    pub access_token: SecretString,
}

impl ClusterEndpointConfig {
    pub fn new(settings: AgentSettings, access_token: SecretString) -> Self {
        Self {
            external_id: settings.external_id,
            id_source: settings.id_source,
            internal_id: None,
            ocm_base_url: settings.ocm_base_url,
            services: settings.services,
            access_token,
        }
    }
}

fn require_value(data: &BTreeMap<String, String>, key: &str) -> Result<String, HarnessError> {
    match data.get(key) {
        None => Err(HarnessError::precondition(format!("{key} not configured"))),
        Some(value) if value.is_empty() => {
            Err(HarnessError::precondition(format!("{key} is empty")))
        }
        Some(value) => Ok(value.clone()),
    }
}

/// Read the agent ConfigMap and resolve the external cluster ID.
///
/// Fails when the ConfigMap is missing, when no source yields an ID, or when
/// `ocmBaseURL` / `services` are absent or empty.
pub async fn resolve_settings(
    cluster: &dyn ClusterReader,
    config: &HarnessConfig,
) -> Result<AgentSettings, HarnessError> {
    let data = cluster
        .config_map_data(&config.namespace, &config.configmap)
        .await?
        .ok_or_else(|| {
            HarnessError::precondition(format!(
                "configmap {}/{} not found",
                config.namespace, config.configmap
            ))
        })?;

    let (id_source, external_id) =
        resolve_external_id(&IdSource::DEFAULT_CHAIN, cluster, &data)
            .await
            .ok_or_else(|| {
                HarnessError::precondition(
                    "external cluster ID should not be empty: no source provided one",
                )
            })?;

    info!(
        target: "ocm_e2e.discovery",
        external_id = %external_id,
        source = %id_source,
        "Resolved external cluster ID"
    );

    Ok(AgentSettings {
        external_id,
        id_source,
        ocm_base_url: require_value(&data, keys::OCM_BASE_URL)?,
        services: require_value(&data, keys::SERVICES)?,
    })
}

/// Read the OCM access token from the agent Secret.
pub async fn resolve_access_token(
    cluster: &dyn ClusterReader,
    config: &HarnessConfig,
) -> Result<SecretString, HarnessError> {
    let data = cluster
        .secret_data(&config.namespace, &config.secret)
        .await?
        .ok_or_else(|| {
            HarnessError::precondition(format!(
                "secret {}/{} not found",
                config.namespace, config.secret
            ))
        })?;

    let raw = data.get(keys::ACCESS_TOKEN).ok_or_else(|| {
        HarnessError::precondition(format!("{} not found in secret", keys::ACCESS_TOKEN))
    })?;

    let token = String::from_utf8_lossy(raw).trim().to_string();
    if token.is_empty() {
        return Err(HarnessError::precondition("access token is empty"));
    }

    Ok(SecretString::from(token))
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
    use crate::mock::FakeCluster;
    use secrecy::ExposeSecret;

    fn agent_configmap(cluster_id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (keys::CLUSTER_ID.to_string(), cluster_id.to_string()),
            (
                keys::OCM_BASE_URL.to_string(),
                "https://api.openshift.com".to_string(),
            ),
            (
                keys::SERVICES.to_string(),
                "service_logs,clusters".to_string(),
            ),
        ])
    }

    fn cluster_with(configmap: BTreeMap<String, String>) -> FakeCluster {
        let config = HarnessConfig::default();
        FakeCluster::new().with_config_map(&config.namespace, &config.configmap, configmap)
    }

    #[tokio::test]
    async fn test_configmap_id_wins() {
        let cluster = cluster_with(agent_configmap("from-configmap"))
            .with_cluster_version_id("from-version")
            .with_infrastructure_name("from-infra");

        let settings = resolve_settings(&cluster, &HarnessConfig::default())
            .await
            .unwrap();

        assert_eq!(settings.external_id, "from-configmap");
        assert_eq!(settings.id_source, IdSource::ConfigMap);
        assert_eq!(cluster.fallback_reads(), 0, "chain should short-circuit");
    }

    #[tokio::test]
    async fn test_empty_configmap_id_falls_back_to_cluster_version() {
        let cluster = cluster_with(agent_configmap("")).with_cluster_version_id("abc123");

        let settings = resolve_settings(&cluster, &HarnessConfig::default())
            .await
            .unwrap();

        assert_eq!(settings.external_id, "abc123");
        assert_eq!(settings.id_source, IdSource::ClusterVersion);
        assert_eq!(cluster.fallback_reads(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_infrastructure() {
        let mut configmap = agent_configmap("");
        configmap.remove(keys::CLUSTER_ID);
        let cluster = cluster_with(configmap)
            .with_cluster_version_id("")
            .with_infrastructure_name("infra-xyz");

        let settings = resolve_settings(&cluster, &HarnessConfig::default())
            .await
            .unwrap();

        assert_eq!(settings.external_id, "infra-xyz");
        assert_eq!(settings.id_source, IdSource::Infrastructure);
    }

    #[tokio::test]
    async fn test_no_source_is_fatal() {
        let cluster = cluster_with(agent_configmap(""));

        let err = resolve_settings(&cluster, &HarnessConfig::default())
            .await
            .expect_err("no ID anywhere should fail");

        assert!(err.to_string().contains("external cluster ID"));
    }

    #[tokio::test]
    async fn test_missing_configmap_is_fatal() {
        let cluster = FakeCluster::new();

        let err = resolve_settings(&cluster, &HarnessConfig::default())
            .await
            .expect_err("missing configmap should fail");

        assert!(matches!(err, HarnessError::Precondition(msg) if msg.contains("ocm-agent-cm")));
    }

    #[tokio::test]
    async fn test_missing_base_url_is_fatal() {
        let mut configmap = agent_configmap("abc");
        configmap.remove(keys::OCM_BASE_URL);
        let cluster = cluster_with(configmap);

        let err = resolve_settings(&cluster, &HarnessConfig::default())
            .await
            .expect_err("missing ocmBaseURL should fail");

        assert!(err.to_string().contains("ocmBaseURL not configured"));
    }

    #[tokio::test]
    async fn test_empty_services_is_fatal() {
        let mut configmap = agent_configmap("abc");
        configmap.insert(keys::SERVICES.to_string(), String::new());
        let cluster = cluster_with(configmap);

        let err = resolve_settings(&cluster, &HarnessConfig::default())
            .await
            .expect_err("empty services should fail");

        assert!(err.to_string().contains("services is empty"));
    }

    #[tokio::test]
    async fn test_access_token_resolution() {
        let config = HarnessConfig::default();
        let cluster = FakeCluster::new().with_secret(
            &config.namespace,
            &config.secret,
            BTreeMap::from([(keys::ACCESS_TOKEN.to_string(), b"token-value\n".to_vec())]),
        );

        let token = resolve_access_token(&cluster, &config).await.unwrap();
        assert_eq!(token.expose_secret(), "token-value");
    }

    #[tokio::test]
    async fn test_access_token_missing_key_or_empty() {
        let config = HarnessConfig::default();

        let no_key = FakeCluster::new().with_secret(&config.namespace, &config.secret, BTreeMap::new());
        let err = resolve_access_token(&no_key, &config).await.unwrap_err();
        assert!(err.to_string().contains("access_token not found"));

        let empty = FakeCluster::new().with_secret(
            &config.namespace,
            &config.secret,
            BTreeMap::from([(keys::ACCESS_TOKEN.to_string(), Vec::new())]),
        );
        let err = resolve_access_token(&empty, &config).await.unwrap_err();
        assert!(err.to_string().contains("access token is empty"));
    }

    #[test]
    fn test_endpoint_config_debug_redacts_token() {
        let settings = AgentSettings {
            external_id: "ext".to_string(),
            id_source: IdSource::ConfigMap,
            ocm_base_url: "https://api.openshift.com".to_string(),
            services: "clusters".to_string(),
        };
        let endpoint = ClusterEndpointConfig::new(settings, SecretString::from("very-secret"));

        let debug = format!("{endpoint:?}");
        assert!(!debug.contains("very-secret"));
        assert!(endpoint.internal_id.is_none());
    }
}
