//! In-memory fakes for the harness seams.
//!
//! These let the scenario tests drive a full run without a cluster, an OCM
//! account or a `kubectl` binary. The agent itself is played by a wiremock
//! server that a [`StaticTunnel`] points the harness at.

use crate::cluster::{
    ClusterError, ClusterReader, ContainerView, DeploymentView, PodPhase, PodView,
};
use crate::config::{keys, HarnessConfig};
use crate::discovery::ClusterEndpointConfig;
use crate::fixtures::ocm_api::{IdentityExchange, UpstreamError};
use crate::fixtures::ocm_cli::{CliError, OcmCommand};
use crate::fixtures::port_forward::{PortForwardError, Tunnel, TunnelLauncher};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// A pod in `Running` phase with one ready container that never restarted.
pub fn running_pod(name: &str) -> PodView {
    PodView {
        name: name.to_string(),
        phase: PodPhase::Running,
        containers: vec![ContainerView {
            name: "ocm-agent".to_string(),
            ready: true,
            restart_count: 0,
        }],
    }
}

/// A deployment reporting `Available=True` with the default restart policy.
pub fn available_deployment(name: &str) -> DeploymentView {
    DeploymentView {
        name: name.to_string(),
        available: true,
        restart_policy: None,
    }
}

/// Canned cluster state.
///
/// Pods are listed per namespace; the label selector is not evaluated.
#[derive(Debug, Default)]
pub struct FakeCluster {
    namespaces: HashSet<String>,
    deployments: HashMap<(String, String), DeploymentView>,
    config_maps: HashMap<(String, String), BTreeMap<String, String>>,
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    pods: Vec<(String, PodView)>,
    cluster_version_id: Option<String>,
    infrastructure_name: Option<String>,
    fallback_reads: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything a passing run needs: namespace, available deployments,
    /// agent ConfigMap with `external_id`, token Secret and one running pod.
    pub fn healthy(config: &HarnessConfig, external_id: &str, ocm_base_url: &str) -> Self {
        let configmap = BTreeMap::from([
            (keys::CLUSTER_ID.to_string(), external_id.to_string()),
            (keys::OCM_BASE_URL.to_string(), ocm_base_url.to_string()),
            (
                keys::SERVICES.to_string(),
                "service_logs,clusters".to_string(),
            ),
        ]);
        let secret = BTreeMap::from([(keys::ACCESS_TOKEN.to_string(), b"e2e-token".to_vec())]);

        let mut cluster = Self::new()
            .with_namespace(&config.namespace)
            .with_config_map(&config.namespace, &config.configmap, configmap)
            .with_secret(&config.namespace, &config.secret, secret)
            .with_pod(&config.namespace, running_pod("ocm-agent-6d4f9c7b8-x2x7q"));

        for name in &config.deployments {
            cluster = cluster.with_deployment(&config.namespace, available_deployment(name));
        }
        cluster
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespaces.insert(namespace.to_string());
        self
    }

    pub fn with_deployment(mut self, namespace: &str, deployment: DeploymentView) -> Self {
        self.deployments.insert(
            (namespace.to_string(), deployment.name.clone()),
            deployment,
        );
        self
    }

    pub fn with_config_map(
        mut self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Self {
        self.config_maps
            .insert((namespace.to_string(), name.to_string()), data);
        self
    }

    pub fn with_secret(
        mut self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        self.secrets
            .insert((namespace.to_string(), name.to_string()), data);
        self
    }

    /// Add a pod, replacing any pod of the same name in that namespace.
    pub fn with_pod(mut self, namespace: &str, pod: PodView) -> Self {
        self.pods
            .retain(|(ns, existing)| !(ns == namespace && existing.name == pod.name));
        self.pods.push((namespace.to_string(), pod));
        self
    }

    pub fn without_pods(mut self) -> Self {
        self.pods.clear();
        self
    }

    /// Stored as given; an empty string models an object with the field unset.
    pub fn with_cluster_version_id(mut self, id: &str) -> Self {
        self.cluster_version_id = Some(id.to_string());
        self
    }

    pub fn with_infrastructure_name(mut self, name: &str) -> Self {
        self.infrastructure_name = Some(name.to_string());
        self
    }

    /// Number of reads of the ClusterVersion and Infrastructure fallbacks.
    pub fn fallback_reads(&self) -> usize {
        self.fallback_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterReader for FakeCluster {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ClusterError> {
        Ok(self.namespaces.contains(namespace))
    }

    async fn deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentView>, ClusterError> {
        Ok(self
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ClusterError> {
        Ok(self
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, ClusterError> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        _label_selector: &str,
    ) -> Result<Vec<PodView>, ClusterError> {
        Ok(self
            .pods
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<PodView>, ClusterError> {
        Ok(self
            .pods
            .iter()
            .find(|(ns, pod)| ns == namespace && pod.name == name)
            .map(|(_, pod)| pod.clone()))
    }

    async fn cluster_version_id(&self) -> Result<Option<String>, ClusterError> {
        self.fallback_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.cluster_version_id.clone())
    }

    async fn infrastructure_name(&self) -> Result<Option<String>, ClusterError> {
        self.fallback_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.infrastructure_name.clone())
    }
}

/// Identity exchange with a fixed answer.
#[derive(Debug)]
pub struct MockIdentity {
    internal_id: Option<String>,
    requested: Mutex<Vec<String>>,
}

impl MockIdentity {
    pub fn resolving(internal_id: &str) -> Self {
        Self {
            internal_id: Some(internal_id.to_string()),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Every exchange reports the cluster as unregistered.
    pub fn failing() -> Self {
        Self {
            internal_id: None,
            requested: Mutex::new(Vec::new()),
        }
    }

    /// External IDs the harness asked about, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl IdentityExchange for MockIdentity {
    async fn internal_id(
        &self,
        endpoint: &ClusterEndpointConfig,
    ) -> Result<String, UpstreamError> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint.external_id.clone());
        self.internal_id
            .clone()
            .ok_or_else(|| UpstreamError::ClusterNotFound(endpoint.external_id.clone()))
    }
}

/// How [`MockOcm`] answers `ocm get`.
#[derive(Debug, Clone)]
pub enum GetReply {
    /// The last posted body, with the created id added.
    Echo,
    Fixed(Value),
    Fail,
    InvalidJson,
}

/// How [`MockOcm`] answers `ocm post`.
#[derive(Debug, Clone)]
pub enum PostReply {
    /// `{"id": <id>}` plus the posted fields.
    Created(String),
    Fixed(Value),
    Fail,
}

/// Records every `ocm` invocation and answers from canned replies.
#[derive(Debug)]
pub struct MockOcm {
    post_reply: PostReply,
    get_reply: GetReply,
    fail_delete: bool,
    calls: Mutex<Vec<(String, String)>>,
    last_posted: Mutex<Option<Value>>,
}

impl Default for MockOcm {
    fn default() -> Self {
        Self {
            post_reply: PostReply::Created("lsr-e2e-1".to_string()),
            get_reply: GetReply::Echo,
            fail_delete: false,
            calls: Mutex::new(Vec::new()),
            last_posted: Mutex::new(None),
        }
    }
}

impl MockOcm {
    /// Creates record `lsr-e2e-1` and echoes it back on get.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post_reply(mut self, reply: PostReply) -> Self {
        self.post_reply = reply;
        self
    }

    pub fn with_get_reply(mut self, reply: GetReply) -> Self {
        self.get_reply = reply;
        self
    }

    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    /// `(verb, path)` of every invocation, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Paths passed to `ocm delete`.
    pub fn deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(verb, _)| verb == "delete")
            .map(|(_, path)| path)
            .collect()
    }

    fn record(&self, verb: &str, path: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((verb.to_string(), path.to_string()));
    }

    fn failure(verb: &str) -> CliError {
        CliError::Failed {
            program: "ocm".to_string(),
            verb: verb.to_string(),
            status: "exit status: 1".to_string(),
            stderr: "Error: mock failure".to_string(),
        }
    }

    fn with_id(body: &Value, id: &str) -> Value {
        let mut record = body.clone();
        if let Some(fields) = record.as_object_mut() {
            fields.insert("id".to_string(), Value::String(id.to_string()));
        }
        record
    }
}

#[async_trait]
impl OcmCommand for MockOcm {
    async fn post(&self, path: &str, body: &Value) -> Result<Value, CliError> {
        self.record("post", path);
        *self
            .last_posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(body.clone());

        match &self.post_reply {
            PostReply::Created(id) => Ok(Self::with_id(body, id)),
            PostReply::Fixed(value) => Ok(value.clone()),
            PostReply::Fail => Err(Self::failure("post")),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, CliError> {
        self.record("get", path);

        match &self.get_reply {
            GetReply::Echo => {
                let posted = self
                    .last_posted
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .unwrap_or(Value::Null);
                let id = match &self.post_reply {
                    PostReply::Created(id) => id.as_str(),
                    _ => "",
                };
                Ok(Self::with_id(&posted, id))
            }
            GetReply::Fixed(value) => Ok(value.clone()),
            GetReply::Fail => Err(Self::failure("get")),
            GetReply::InvalidJson => Err(CliError::InvalidJson {
                verb: "get".to_string(),
                message: "expected value at line 1 column 1".to_string(),
            }),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), CliError> {
        self.record("delete", path);
        if self.fail_delete {
            return Err(Self::failure("delete"));
        }
        Ok(())
    }
}

/// Tunnel to a fixed address (typically a wiremock server).
#[derive(Debug)]
pub struct StaticTunnel {
    base_url: String,
    metrics_base_url: String,
    fail: bool,
    open_count: AtomicUsize,
}

impl StaticTunnel {
    pub fn new(base_url: impl Into<String>, metrics_base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            metrics_base_url: metrics_base_url.into(),
            fail: false,
            open_count: AtomicUsize::new(0),
        }
    }

    /// Every open fails as if `kubectl` were missing.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("", "")
        }
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelLauncher for StaticTunnel {
    async fn open(&self, _namespace: &str, _pod: &str) -> Result<Tunnel, PortForwardError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PortForwardError::Spawn {
                program: "kubectl".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "kubectl not found"),
            });
        }

        Ok(Tunnel {
            base_url: self.base_url.clone(),
            metrics_base_url: self.metrics_base_url.clone(),
            process: None,
        })
    }
}
