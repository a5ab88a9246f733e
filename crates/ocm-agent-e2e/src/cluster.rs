//! Read-only access to cluster state.
//!
//! The harness only ever reads cluster objects. [`ClusterReader`] is the seam:
//! [`KubeCluster`] talks to the API server through kube-rs, and
//! [`crate::mock::FakeCluster`] serves canned objects to the scenario tests.
//!
//! Objects are flattened into small views (`PodView`, `DeploymentView`)
//! holding just the fields the checks look at.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use kube::api::{Api, DynamicObject, ListParams};
use kube::discovery::ApiResource;
use kube::Client;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Name of the cluster-scoped ClusterVersion singleton.
pub const CLUSTER_VERSION_NAME: &str = "version";

/// Name of the cluster-scoped Infrastructure singleton.
pub const INFRASTRUCTURE_NAME: &str = "cluster";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),
}

/// Pod lifecycle phase as reported in `status.phase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerView {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodView {
    pub name: String,
    pub phase: PodPhase,
    pub containers: Vec<ContainerView>,
}

impl PodView {
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running
    }
}

impl From<&Pod> for PodView {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let containers = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|c| ContainerView {
                        name: c.name.clone(),
                        ready: c.ready,
                        restart_count: c.restart_count,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase: PodPhase::parse(status.and_then(|s| s.phase.as_deref())),
            containers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentView {
    pub name: String,
    /// `Available` condition is `True`.
    pub available: bool,
    /// Pod template restart policy; `None` means the API default (`Always`).
    pub restart_policy: Option<String>,
}

impl From<&Deployment> for DeploymentView {
    fn from(deployment: &Deployment) -> Self {
        let available = deployment
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Available" && c.status == "True")
            });

        let restart_policy = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.restart_policy.clone());

        Self {
            name: deployment.metadata.name.clone().unwrap_or_default(),
            available,
            restart_policy,
        }
    }
}

/// Cluster reads the harness depends on.
///
/// Every lookup by name returns `Ok(None)` when the object does not exist, so
/// callers can tell "absent" from "API unreachable".
#[async_trait]
pub trait ClusterReader: Send + Sync {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError>;

    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentView>, ClusterError>;

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ClusterError>;

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ClusterError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodView>, ClusterError>;

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<PodView>, ClusterError>;

    /// `spec.clusterID` of the ClusterVersion singleton.
    async fn cluster_version_id(&self) -> Result<Option<String>, ClusterError>;

    /// `status.infrastructureName` of the Infrastructure singleton.
    async fn infrastructure_name(&self) -> Result<Option<String>, ClusterError>;
}

fn cluster_version_resource() -> ApiResource {
    ApiResource {
        group: "config.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "config.openshift.io/v1".to_string(),
        kind: "ClusterVersion".to_string(),
        plural: "clusterversions".to_string(),
    }
}

fn infrastructure_resource() -> ApiResource {
    ApiResource {
        group: "config.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "config.openshift.io/v1".to_string(),
        kind: "Infrastructure".to_string(),
        plural: "infrastructures".to_string(),
    }
}

/// Read a string field out of a dynamic object, treating `""` as absent.
fn dynamic_string(object: &DynamicObject, pointer: &str) -> Option<String> {
    object
        .data
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// [`ClusterReader`] backed by the API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    async fn cluster_scoped_field(
        &self,
        resource: ApiResource,
        name: &str,
        pointer: &str,
    ) -> Result<Option<String>, ClusterError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let object = api.get_opt(name).await?;
        Ok(object.as_ref().and_then(|o| dynamic_string(o, pointer)))
    }
}

#[async_trait]
impl ClusterReader for KubeCluster {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(namespace).await?.is_some())
    }

    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentView>, ClusterError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(DeploymentView::from))
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(name)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodView>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;

        debug!(
            target: "ocm_e2e.cluster",
            namespace = %namespace,
            selector = %label_selector,
            count = pods.items.len(),
            "Listed pods"
        );

        Ok(pods.items.iter().map(PodView::from).collect())
    }

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<PodView>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(PodView::from))
    }

    async fn cluster_version_id(&self) -> Result<Option<String>, ClusterError> {
        self.cluster_scoped_field(
            cluster_version_resource(),
            CLUSTER_VERSION_NAME,
            "/spec/clusterID",
        )
        .await
    }

    async fn infrastructure_name(&self) -> Result<Option<String>, ClusterError> {
        self.cluster_scoped_field(
            infrastructure_resource(),
            INFRASTRUCTURE_NAME,
            "/status/infrastructureName",
        )
        .await
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
    use serde_json::json;

    #[test]
    fn test_pod_view_from_running_pod() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "ocm-agent-7f9c-abcde" },
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "ocm-agent",
                    "ready": true,
                    "restartCount": 1,
                    "image": "quay.io/app-sre/ocm-agent:latest",
                    "imageID": ""
                }]
            }
        }))
        .unwrap();

        let view = PodView::from(&pod);

        assert_eq!(view.name, "ocm-agent-7f9c-abcde");
        assert!(view.is_running());
        assert_eq!(
            view.containers,
            vec![ContainerView {
                name: "ocm-agent".to_string(),
                ready: true,
                restart_count: 1,
            }]
        );
    }

    #[test]
    fn test_pod_view_without_status() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": { "name": "pending-pod" }
        }))
        .unwrap();

        let view = PodView::from(&pod);

        assert_eq!(view.phase, PodPhase::Unknown);
        assert!(!view.is_running());
        assert!(view.containers.is_empty());
    }

    #[test]
    fn test_deployment_view_available() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "ocm-agent" },
            "spec": {
                "selector": { "matchLabels": { "app": "ocm-agent" } },
                "template": { "spec": { "containers": [], "restartPolicy": "Always" } }
            },
            "status": {
                "conditions": [
                    { "type": "Progressing", "status": "True" },
                    { "type": "Available", "status": "True" }
                ]
            }
        }))
        .unwrap();

        let view = DeploymentView::from(&deployment);

        assert_eq!(view.name, "ocm-agent");
        assert!(view.available);
        assert_eq!(view.restart_policy.as_deref(), Some("Always"));
    }

    #[test]
    fn test_deployment_view_unavailable() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "ocm-agent-operator" },
            "status": {
                "conditions": [{ "type": "Available", "status": "False" }]
            }
        }))
        .unwrap();

        let view = DeploymentView::from(&deployment);

        assert!(!view.available);
        assert_eq!(view.restart_policy, None);
    }

    #[test]
    fn test_dynamic_string_treats_empty_as_absent() {
        let resource = cluster_version_resource();
        let mut object = DynamicObject::new(CLUSTER_VERSION_NAME, &resource);
        object.data = json!({ "spec": { "clusterID": "" } });
        assert_eq!(dynamic_string(&object, "/spec/clusterID"), None);

        object.data = json!({ "spec": { "clusterID": "abc123" } });
        assert_eq!(
            dynamic_string(&object, "/spec/clusterID").as_deref(),
            Some("abc123")
        );
    }
}
