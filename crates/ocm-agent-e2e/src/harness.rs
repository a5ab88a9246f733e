//! Conformance run against one deployed ocm-agent.
//!
//! [`ConformanceHarness::run`] walks the fixed step sequence and returns a
//! [`Report`]. Environment problems end the run; problems reaching OCM only
//! skip the checks that need OCM; probe statuses are judged against their
//! allow-sets. Everything the run acquires is released through a
//! [`CleanupScope`], whatever the outcome.

use crate::cleanup::CleanupScope;
use crate::cluster::{ClusterReader, KubeCluster, PodView};
use crate::config::HarnessConfig;
use crate::discovery::{resolve_access_token, resolve_settings, ClusterEndpointConfig};
use crate::error::{HarnessError, SkipOnError, StepResult};
use crate::eventual::{wait_for, ConsistencyCategory, PollPolicy};
use crate::fixtures::agent_client::{paths, AgentClient, HttpReply};
use crate::fixtures::ocm_api::{IdentityExchange, OcmApiClient};
use crate::fixtures::ocm_cli::{record_id, LimitedSupportReason, OcmCli, OcmCommand};
use crate::fixtures::port_forward::{KubectlPortForward, TunnelLauncher};
use crate::probes::{self, run_probe, Probe, ProbeVerdict};
use crate::report::{Report, Step};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct ConformanceHarness {
    config: HarnessConfig,
    cluster: Arc<dyn ClusterReader>,
    identity: Arc<dyn IdentityExchange>,
    ocm: Arc<dyn OcmCommand>,
    launcher: Arc<dyn TunnelLauncher>,
    deployment_wait: PollPolicy,
    liveness_wait: PollPolicy,
}

impl ConformanceHarness {
    pub fn new(
        config: HarnessConfig,
        cluster: Arc<dyn ClusterReader>,
        identity: Arc<dyn IdentityExchange>,
        ocm: Arc<dyn OcmCommand>,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> Self {
        Self {
            config,
            cluster,
            identity,
            ocm,
            launcher,
            deployment_wait: ConsistencyCategory::DeploymentAvailable.policy(),
            liveness_wait: ConsistencyCategory::PortForwardReady.policy(),
        }
    }

    /// Harness wired to the real cluster, OCM API, `ocm` and `kubectl`.
    pub async fn connect(config: HarnessConfig) -> Result<Self, HarnessError> {
        let cluster = KubeCluster::try_default().await?;
        let identity = OcmApiClient::new(config.http_timeout)?;
        let ocm = OcmCli::new(config.ocm_bin.clone());
        let launcher = KubectlPortForward::from_config(&config);

        Ok(Self::new(
            config,
            Arc::new(cluster),
            Arc::new(identity),
            Arc::new(ocm),
            Arc::new(launcher),
        ))
    }

    /// Override how long deployments may take to become available.
    pub fn with_deployment_wait(mut self, policy: PollPolicy) -> Self {
        self.deployment_wait = policy;
        self
    }

    /// Override how long the forwarded `/livez` may take to answer.
    pub fn with_liveness_wait(mut self, policy: PollPolicy) -> Self {
        self.liveness_wait = policy;
        self
    }

    /// Run every step and release everything acquired on the way.
    ///
    /// A panic inside a step is re-raised after cleanup.
    pub async fn run(&self) -> Report {
        info!(
            target: "ocm_e2e.harness",
            namespace = %self.config.namespace,
            deployments = ?self.config.deployments,
            "Starting ocm-agent conformance run"
        );

        let scope = CleanupScope::new();
        let mut report = Report::new();
        scope.guard(self.execute(&scope, &mut report)).await;

        info!(
            target: "ocm_e2e.harness",
            verdict = ?report.verdict(),
            probes = report.probes().len(),
            "Conformance run finished"
        );
        report
    }

    /// Step sequence. `None` means the run stopped early; the report says why.
    async fn execute(&self, scope: &CleanupScope, report: &mut Report) -> Option<()> {
        report.gate(
            Step::Preconditions,
            StepResult::from(self.check_preconditions().await),
        )?;

        let settings = report.gate(
            Step::Configuration,
            StepResult::from(resolve_settings(self.cluster.as_ref(), &self.config).await),
        )?;
        let token = report.gate(
            Step::Credentials,
            StepResult::from(resolve_access_token(self.cluster.as_ref(), &self.config).await),
        )?;

        let mut endpoint = ClusterEndpointConfig::new(settings, token);
        endpoint.internal_id =
            report.optional(Step::IdentityExchange, self.exchange_identity(&endpoint).await)?;

        let pod = report.gate(
            Step::TargetSelection,
            StepResult::from(self.select_target().await),
        )?;
        let client = report.gate(Step::PortForward, self.open_tunnel(scope, &pod).await)?;
        report.gate(
            Step::StartupVerification,
            StepResult::from(self.verify_startup(&pod).await),
        )?;

        probe_step(report, &client, Step::HealthProbes, &[probes::livez(), probes::readyz()])
            .await?;
        probe_step(report, &client, Step::NegativeProbe, &[probes::invalid_path()]).await?;
        timeout_probe(report, &client).await;
        probe_step(report, &client, Step::MetricsProbe, &[probes::metrics()]).await?;

        match endpoint.internal_id.as_deref() {
            Some(internal_id) => {
                proxy_probes(report, &client, internal_id).await?;
                self.round_trip(scope, report, &client, internal_id).await?;
            }
            None => {
                let reason = "no internal cluster ID; cluster may not be registered in OCM";
                report.skip(Step::ProxyProbes, reason);
                report.skip(Step::RoundTrip, reason);
            }
        }

        let stability = self.check_stability(report, &client, &pod).await;
        report.gate(Step::FinalStability, StepResult::from(stability))
    }

    async fn check_preconditions(&self) -> Result<(), HarnessError> {
        let namespace = &self.config.namespace;
        if !self.cluster.namespace_exists(namespace).await? {
            return Err(HarnessError::precondition(format!(
                "namespace {namespace} not found"
            )));
        }

        for name in &self.config.deployments {
            wait_for(self.deployment_wait, || self.deployment_available(name))
                .await
                .map_err(|e| {
                    HarnessError::precondition(format!(
                        "deployment {namespace}/{name} is not available: {e}"
                    ))
                })?;

            let restart_policy = self
                .cluster
                .deployment(namespace, name)
                .await?
                .and_then(|d| d.restart_policy);
            // Unset means the API default, Always.
            if let Some(policy) = restart_policy.filter(|p| p != "Always") {
                return Err(HarnessError::precondition(format!(
                    "deployment {namespace}/{name} has restart policy {policy}, expected Always"
                )));
            }

            info!(target: "ocm_e2e.harness", deployment = %name, "Deployment available");
        }

        Ok(())
    }

    async fn deployment_available(&self, name: &str) -> Result<(), String> {
        match self.cluster.deployment(&self.config.namespace, name).await {
            Ok(Some(deployment)) if deployment.available => Ok(()),
            Ok(Some(_)) => Err("Available condition is not True".to_string()),
            Ok(None) => Err("deployment not found".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn exchange_identity(&self, endpoint: &ClusterEndpointConfig) -> StepResult<String> {
        let result = self
            .identity
            .internal_id(endpoint)
            .await
            .or_skip("Failed to get internal cluster ID, cluster may not be registered in OCM");

        match &result {
            StepResult::Ok(internal_id) => info!(
                target: "ocm_e2e.harness",
                external_id = %endpoint.external_id,
                internal_id = %internal_id,
                "Resolved internal cluster ID"
            ),
            StepResult::Skip(reason) => warn!(
                target: "ocm_e2e.harness",
                external_id = %endpoint.external_id,
                reason = %reason,
                "Skipping OCM-dependent checks"
            ),
            StepResult::Fatal(_) => {}
        }
        result
    }

    async fn select_target(&self) -> Result<PodView, HarnessError> {
        let namespace = &self.config.namespace;
        let selector = &self.config.label_selector;

        let pods = self.cluster.list_pods(namespace, selector).await?;
        if pods.is_empty() {
            return Err(HarnessError::precondition(format!(
                "no pods match {selector} in {namespace}"
            )));
        }

        let pod = pods.into_iter().find(PodView::is_running).ok_or_else(|| {
            HarnessError::precondition(format!("no running pod matches {selector} in {namespace}"))
        })?;

        info!(target: "ocm_e2e.harness", pod = %pod.name, "Selected target pod");
        Ok(pod)
    }

    async fn open_tunnel(&self, scope: &CleanupScope, pod: &PodView) -> StepResult<AgentClient> {
        let tunnel = match self.launcher.open(&self.config.namespace, &pod.name).await {
            Ok(tunnel) => tunnel,
            Err(e) => return StepResult::skip(format!("cannot forward to {}: {e}", pod.name)),
        };

        if let Some(process) = tunnel.process {
            scope.defer(format!("port-forward to {}", pod.name), move || {
                process.shutdown()
            });
        }

        let client = match AgentClient::new(
            tunnel.base_url,
            tunnel.metrics_base_url,
            self.config.http_timeout,
        ) {
            Ok(client) => client,
            Err(e) => return StepResult::fatal(e),
        };

        if let Err(e) = wait_for(self.liveness_wait, || client.check_live()).await {
            return StepResult::fatal(HarnessError::assertion(format!(
                "port forwarding should be ready: {e}"
            )));
        }

        StepResult::Ok(client)
    }

    async fn verify_startup(&self, target: &PodView) -> Result<(), HarnessError> {
        let pod = self
            .cluster
            .pod(&self.config.namespace, &target.name)
            .await?
            .ok_or_else(|| HarnessError::assertion(format!("pod {} disappeared", target.name)))?;

        if !pod.is_running() {
            return Err(HarnessError::assertion(format!(
                "pod {} is {:?}, expected Running",
                pod.name, pod.phase
            )));
        }
        if pod.containers.is_empty() {
            return Err(HarnessError::assertion(format!(
                "pod {} reports no container statuses",
                pod.name
            )));
        }

        for container in &pod.containers {
            if !container.ready {
                return Err(HarnessError::assertion(format!(
                    "container {} in pod {} is not ready",
                    container.name, pod.name
                )));
            }
            if container.restart_count > self.config.max_restarts {
                return Err(HarnessError::assertion(format!(
                    "container {} restarted {} times, at most {} allowed",
                    container.name, container.restart_count, self.config.max_restarts
                )));
            }
        }

        Ok(())
    }

    /// Create a limited support reason with `ocm`, read it through the agent
    /// and back from OCM. The record is deleted when the run ends.
    async fn round_trip(
        &self,
        scope: &CleanupScope,
        report: &mut Report,
        client: &AgentClient,
        internal_id: &str,
    ) -> Option<()> {
        let step = Step::RoundTrip;
        let submitted = LimitedSupportReason::e2e();
        let collection = paths::limited_support_reasons(internal_id);

        let body = match serde_json::to_value(&submitted) {
            Ok(body) => body,
            Err(e) => {
                report.skip(step, format!("cannot encode limited support reason: {e}"));
                return Some(());
            }
        };

        let created = match self.ocm.post(&collection, &body).await {
            Ok(created) => created,
            Err(e) => {
                report.skip(
                    step,
                    format!("Failed to create limited support reason via ocm CLI: {e}"),
                );
                return Some(());
            }
        };
        let Some(reason_id) = record_id(&created) else {
            report.skip(step, "ocm post reply carries no limited support reason id");
            return Some(());
        };

        let record_path = paths::limited_support_reason(internal_id, &reason_id);
        let ocm = Arc::clone(&self.ocm);
        let delete_path = record_path.clone();
        scope.defer(
            format!("delete limited support reason {reason_id}"),
            move || async move {
                match ocm.delete(&delete_path).await {
                    Ok(()) => info!(
                        target: "ocm_e2e.harness",
                        path = %delete_path,
                        "Deleted limited support reason"
                    ),
                    Err(e) => warn!(
                        target: "ocm_e2e.harness",
                        path = %delete_path,
                        error = %e,
                        "Failed to delete limited support reason"
                    ),
                }
            },
        );

        let mut notes = Vec::new();
        for probe in [
            probes::limited_support_reasons(internal_id),
            probes::limited_support_reason(internal_id, &reason_id),
        ] {
            match check(report, client, &probe, &mut notes).await {
                Err(reason) => {
                    report.fail(step, reason);
                    return None;
                }
                Ok(None) => {
                    report.skip(
                        step,
                        format!("agent did not answer {}, remaining checks skipped", probe.path),
                    );
                    return Some(());
                }
                Ok(Some(_)) => {}
            }
        }

        match self.ocm.get(&record_path).await {
            Err(e) if e.is_parse_error() => {
                report.fail(step, e);
                None
            }
            Err(e) => {
                report.skip(
                    step,
                    format!("Failed to read limited support reason via ocm CLI: {e}"),
                );
                Some(())
            }
            Ok(fetched) => match submitted.first_mismatch(&fetched) {
                Some((field, expected, actual)) => {
                    report.fail(
                        step,
                        format!("{field} should be {expected:?}, got {actual:?}"),
                    );
                    None
                }
                None => {
                    report.pass_with_notes(step, notes);
                    Some(())
                }
            },
        }
    }

    async fn check_stability(
        &self,
        report: &mut Report,
        client: &AgentClient,
        target: &PodView,
    ) -> Result<(), HarnessError> {
        let mut notes = Vec::new();
        check(report, client, &probes::final_readyz(), &mut notes)
            .await
            .map_err(HarnessError::assertion)?;

        let pod = self.cluster.pod(&self.config.namespace, &target.name).await?;
        match pod {
            Some(pod) if pod.is_running() => Ok(()),
            Some(pod) => Err(HarnessError::assertion(format!(
                "pod {} is {:?} after the run, expected Running",
                pod.name, pod.phase
            ))),
            None => Err(HarnessError::assertion(format!(
                "pod {} no longer exists",
                target.name
            ))),
        }
    }
}

/// Run one probe and record it. `Err` carries the rejection; `Ok(None)` means
/// the agent did not answer.
async fn check(
    report: &mut Report,
    client: &AgentClient,
    probe: &Probe,
    notes: &mut Vec<String>,
) -> Result<Option<HttpReply>, String> {
    let (result, reply) = run_probe(client, probe).await;
    let verdict = result.verdict.clone();
    report.record_probe(result);

    match verdict {
        ProbeVerdict::Accepted => Ok(reply),
        ProbeVerdict::Tolerated(note) => {
            notes.push(note);
            Ok(reply)
        }
        ProbeVerdict::Rejected(reason) => Err(reason),
    }
}

/// Run `probes` as one step; the first rejection fails the step and the run.
async fn probe_step(
    report: &mut Report,
    client: &AgentClient,
    step: Step,
    probes: &[Probe],
) -> Option<()> {
    let mut notes = Vec::new();
    for probe in probes {
        if let Err(reason) = check(report, client, probe, &mut notes).await {
            report.fail(step, reason);
            return None;
        }
    }
    report.pass_with_notes(step, notes);
    Some(())
}

/// Readiness with a starved budget. Only the outcome and latency are recorded.
async fn timeout_probe(report: &mut Report, client: &AgentClient) {
    let short = match client.with_timeout(probes::TIMEOUT_PROBE_BUDGET) {
        Ok(short) => short,
        Err(e) => {
            report.skip(Step::TimeoutProbe, format!("cannot build short-timeout client: {e}"));
            return;
        }
    };

    let started = Instant::now();
    let (result, _) = run_probe(&short, &probes::readyz_short_timeout()).await;
    let note = format!(
        "{} within {:?} budget after {:?}",
        result.outcome,
        probes::TIMEOUT_PROBE_BUDGET,
        started.elapsed()
    );
    report.record_probe(result);
    report.pass_with_notes(Step::TimeoutProbe, vec![note]);
}

/// Upgrade policy passthrough. The policy id comes from the listing when it
/// has one, so the detail probes hit a real record when possible.
async fn proxy_probes(report: &mut Report, client: &AgentClient, internal_id: &str) -> Option<()> {
    let step = Step::ProxyProbes;
    let mut notes = Vec::new();

    let listing = match check(report, client, &probes::upgrade_policies(internal_id), &mut notes)
        .await
    {
        Ok(listing) => listing,
        Err(reason) => {
            report.fail(step, reason);
            return None;
        }
    };

    let policy_id = listing
        .filter(|reply| reply.status == 200)
        .and_then(|reply| reply.json())
        .and_then(|body| probes::first_policy_id(&body))
        .unwrap_or_else(|| probes::PLACEHOLDER_POLICY_ID.to_string());
    info!(target: "ocm_e2e.harness", policy_id = %policy_id, "Probing upgrade policy");

    for probe in probes::upgrade_policy_probes(internal_id, &policy_id) {
        if let Err(reason) = check(report, client, &probe, &mut notes).await {
            report.fail(step, reason);
            return None;
        }
    }

    report.pass_with_notes(step, notes);
    Some(())
}
