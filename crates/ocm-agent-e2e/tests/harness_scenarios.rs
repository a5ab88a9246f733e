//! Full conformance runs against in-memory cluster fakes and a wiremock agent.
//!
//! No cluster, OCM account or kubectl is needed; these run with the default
//! (empty) feature set.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use ocm_agent_e2e::cluster::PodPhase;
use ocm_agent_e2e::config::keys;
use ocm_agent_e2e::eventual::PollPolicy;
use ocm_agent_e2e::fixtures::agent_client::paths;
use ocm_agent_e2e::fixtures::port_forward::TunnelLauncher;
use ocm_agent_e2e::mock::{
    available_deployment, running_pod, FakeCluster, GetReply, MockIdentity, MockOcm, PostReply,
    StaticTunnel,
};
use ocm_agent_e2e::observability::init_tracing;
use ocm_agent_e2e::probes::{ProbeOutcome, ProbeVerdict, PLACEHOLDER_POLICY_ID};
use ocm_agent_e2e::{ConformanceHarness, HarnessConfig, Step, StepStatus, Verdict};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EXTERNAL_ID: &str = "ext-123";
const INTERNAL_ID: &str = "int-123";
const RECORD_ID: &str = "lsr-e2e-1";
const POLICY_ID: &str = "pol-1";

/// Priority for the default routes; per-test routes use wiremock's default
/// (5) and win.
const DEFAULT_ROUTE_PRIORITY: u8 = 10;

struct Fixture {
    config: HarnessConfig,
    server: MockServer,
    identity: Arc<MockIdentity>,
    ocm: Arc<MockOcm>,
    tunnel: Arc<StaticTunnel>,
}

impl Fixture {
    /// A healthy agent, a registered cluster and a working `ocm`.
    async fn new() -> Self {
        init_tracing();
        let server = healthy_agent().await;
        let tunnel = Arc::new(StaticTunnel::new(server.uri(), server.uri()));

        Self {
            config: HarnessConfig::default(),
            server,
            identity: Arc::new(MockIdentity::resolving(INTERNAL_ID)),
            ocm: Arc::new(MockOcm::new()),
            tunnel,
        }
    }

    fn cluster(&self) -> FakeCluster {
        FakeCluster::healthy(&self.config, EXTERNAL_ID, "https://api.openshift.com")
    }

    fn harness(&self, cluster: FakeCluster) -> ConformanceHarness {
        self.harness_with(cluster, self.tunnel.clone())
    }

    fn harness_with(
        &self,
        cluster: FakeCluster,
        launcher: Arc<dyn TunnelLauncher>,
    ) -> ConformanceHarness {
        ConformanceHarness::new(
            self.config.clone(),
            Arc::new(cluster),
            self.identity.clone(),
            self.ocm.clone(),
            launcher,
        )
        .with_deployment_wait(PollPolicy::fixed(
            Duration::from_millis(200),
            Duration::from_millis(20),
        ))
        .with_liveness_wait(PollPolicy::fixed(
            Duration::from_millis(500),
            Duration::from_millis(50),
        ))
    }

    async fn request_paths(&self) -> Vec<String> {
        self.server
            .received_requests()
            .await
            .expect("request recording is enabled")
            .iter()
            .map(|request| request.url.path().to_string())
            .collect()
    }

    async fn respond(&self, verb: &str, route: &str, status: u16) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }
}

async fn default_route(server: &MockServer, verb: &str, route: &str, response: ResponseTemplate) {
    Mock::given(method(verb))
        .and(path(route))
        .respond_with(response)
        .with_priority(DEFAULT_ROUTE_PRIORITY)
        .mount(server)
        .await;
}

async fn healthy_agent() -> MockServer {
    let server = MockServer::start().await;
    let ok = || ResponseTemplate::new(200).set_body_string("ok");

    default_route(&server, "GET", paths::LIVEZ, ok()).await;
    default_route(&server, "GET", paths::READYZ, ok()).await;
    default_route(
        &server,
        "GET",
        paths::METRICS,
        ResponseTemplate::new(200).set_body_string("# TYPE ocm_agent_up gauge\nocm_agent_up 1\n"),
    )
    .await;
    default_route(&server, "GET", paths::INVALID, ResponseTemplate::new(404)).await;

    default_route(
        &server,
        "GET",
        &paths::upgrade_policies(INTERNAL_ID),
        ResponseTemplate::new(200).set_body_json(json!({
            "kind": "UpgradePolicyList",
            "items": [{ "id": POLICY_ID, "schedule_type": "manual" }]
        })),
    )
    .await;
    default_route(
        &server,
        "GET",
        &paths::upgrade_policy(INTERNAL_ID, POLICY_ID),
        ResponseTemplate::new(200).set_body_json(json!({ "id": POLICY_ID })),
    )
    .await;
    default_route(
        &server,
        "GET",
        &paths::upgrade_policy_state(INTERNAL_ID, POLICY_ID),
        ResponseTemplate::new(200).set_body_json(json!({ "value": "pending" })),
    )
    .await;
    default_route(
        &server,
        "PATCH",
        &paths::upgrade_policy_state(INTERNAL_ID, POLICY_ID),
        ResponseTemplate::new(405),
    )
    .await;
    default_route(
        &server,
        "GET",
        &paths::limited_support_reasons(INTERNAL_ID),
        ResponseTemplate::new(200).set_body_json(json!({ "items": [{ "id": RECORD_ID }] })),
    )
    .await;
    default_route(
        &server,
        "GET",
        &paths::limited_support_reason(INTERNAL_ID, RECORD_ID),
        ResponseTemplate::new(200).set_body_json(json!({ "id": RECORD_ID })),
    )
    .await;

    // Anything else under the proxy is an unknown record.
    Mock::given(path_regex("^/api/"))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(u8::MAX)
        .mount(&server)
        .await;

    server
}

fn status(report: &ocm_agent_e2e::Report, step: Step) -> StepStatus {
    report
        .status_of(step)
        .cloned()
        .unwrap_or_else(|| panic!("step {step} was never reached"))
}

fn assert_failed_at(verdict: &Verdict, step: Step) {
    match verdict {
        Verdict::Failed(reason) => assert!(
            reason.starts_with(&step.to_string()),
            "expected failure at {step}, got: {reason}"
        ),
        other => panic!("expected failure at {step}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_healthy_agent_passes() {
    let fixture = Fixture::new().await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_eq!(report.verdict(), Verdict::Passed, "report: {report:?}");
    for step in [
        Step::Preconditions,
        Step::Configuration,
        Step::Credentials,
        Step::IdentityExchange,
        Step::TargetSelection,
        Step::PortForward,
        Step::StartupVerification,
        Step::HealthProbes,
        Step::NegativeProbe,
        Step::MetricsProbe,
        Step::ProxyProbes,
        Step::RoundTrip,
        Step::FinalStability,
    ] {
        assert_eq!(status(&report, step), StepStatus::Passed, "{step}");
    }
    assert!(matches!(
        status(&report, Step::TimeoutProbe),
        StepStatus::Observed(_)
    ));

    assert_eq!(fixture.identity.requested(), vec![EXTERNAL_ID.to_string()]);
    assert_eq!(fixture.tunnel.open_count(), 1);
}

#[tokio::test]
async fn test_missing_namespace_aborts_before_any_http_request() {
    let fixture = Fixture::new().await;

    let report = fixture.harness(FakeCluster::new()).run().await;

    assert_failed_at(&report.verdict(), Step::Preconditions);
    assert!(!report.reached(Step::Configuration));
    assert!(fixture.request_paths().await.is_empty());
    assert_eq!(fixture.tunnel.open_count(), 0);
    assert!(fixture.identity.requested().is_empty());
}

#[tokio::test]
async fn test_unavailable_deployment_aborts_before_any_http_request() {
    let fixture = Fixture::new().await;
    let cluster = fixture.cluster().with_deployment(
        &fixture.config.namespace,
        ocm_agent_e2e::cluster::DeploymentView {
            available: false,
            ..available_deployment("ocm-agent-operator")
        },
    );

    let report = fixture.harness(cluster).run().await;

    match report.verdict() {
        Verdict::Failed(reason) => {
            assert!(reason.contains("ocm-agent-operator is not available"), "{reason}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(fixture.request_paths().await.is_empty());
}

#[tokio::test]
async fn test_non_default_restart_policy_is_fatal() {
    let fixture = Fixture::new().await;
    let cluster = fixture.cluster().with_deployment(
        &fixture.config.namespace,
        ocm_agent_e2e::cluster::DeploymentView {
            restart_policy: Some("OnFailure".to_string()),
            ..available_deployment("ocm-agent")
        },
    );

    let report = fixture.harness(cluster).run().await;

    assert_failed_at(&report.verdict(), Step::Preconditions);
    assert!(fixture.request_paths().await.is_empty());
}

#[tokio::test]
async fn test_empty_configmap_id_falls_back_to_cluster_version() {
    let fixture = Fixture::new().await;
    let config = &fixture.config;
    let configmap = BTreeMap::from([
        (keys::CLUSTER_ID.to_string(), String::new()),
        (
            keys::OCM_BASE_URL.to_string(),
            "https://api.openshift.com".to_string(),
        ),
        (keys::SERVICES.to_string(), "clusters".to_string()),
    ]);
    let cluster = fixture
        .cluster()
        .with_config_map(&config.namespace, &config.configmap, configmap)
        .with_cluster_version_id("abc123")
        .with_infrastructure_name("infra-should-not-be-used");

    let report = fixture.harness(cluster).run().await;

    assert_eq!(report.verdict(), Verdict::Passed);
    assert_eq!(fixture.identity.requested(), vec!["abc123".to_string()]);
}

#[tokio::test]
async fn test_identity_failure_skips_only_dependent_checks() {
    let fixture = Fixture {
        identity: Arc::new(MockIdentity::failing()),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    assert!(matches!(
        status(&report, Step::IdentityExchange),
        StepStatus::Skipped(reason) if reason.contains("internal cluster ID")
    ));
    assert!(matches!(status(&report, Step::ProxyProbes), StepStatus::Skipped(_)));
    assert!(matches!(status(&report, Step::RoundTrip), StepStatus::Skipped(_)));

    assert_eq!(status(&report, Step::HealthProbes), StepStatus::Passed);
    assert_eq!(status(&report, Step::NegativeProbe), StepStatus::Passed);
    assert_eq!(status(&report, Step::FinalStability), StepStatus::Passed);
    assert_eq!(report.verdict(), Verdict::Passed);

    let requested = fixture.request_paths().await;
    assert!(requested.iter().any(|p| p == paths::LIVEZ));
    assert!(!requested.iter().any(|p| p.starts_with("/api/")));
    assert!(fixture.ocm.calls().is_empty());
}

#[tokio::test]
async fn test_patch_method_not_allowed_is_accepted() {
    let fixture = Fixture::new().await;

    let report = fixture.harness(fixture.cluster()).run().await;

    let patch = report
        .probe("upgrade-policy-state-patch")
        .expect("patch probe ran");
    assert_eq!(patch.outcome, ProbeOutcome::Status(405));
    assert_eq!(patch.verdict, ProbeVerdict::Accepted);
    assert_eq!(
        patch.path,
        paths::upgrade_policy_state(INTERNAL_ID, POLICY_ID)
    );
}

#[tokio::test]
async fn test_proxy_status_outside_allow_set_fails_the_run() {
    let fixture = Fixture::new().await;
    fixture
        .respond("GET", &paths::upgrade_policies(INTERNAL_ID), 500)
        .await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_failed_at(&report.verdict(), Step::ProxyProbes);
    assert!(!report.reached(Step::RoundTrip));
    assert!(fixture.ocm.calls().is_empty());
}

#[tokio::test]
async fn test_empty_policy_listing_uses_placeholder_id() {
    let fixture = Fixture::new().await;
    Mock::given(method("GET"))
        .and(path(paths::upgrade_policies(INTERNAL_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .mount(&fixture.server)
        .await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_eq!(report.verdict(), Verdict::Passed);
    let probed = report.probe("upgrade-policy").expect("detail probe ran");
    assert_eq!(
        probed.path,
        paths::upgrade_policy(INTERNAL_ID, PLACEHOLDER_POLICY_ID)
    );
    assert_eq!(probed.outcome, ProbeOutcome::Status(404));
}

#[tokio::test]
async fn test_round_trip_record_is_verified_and_deleted() {
    let fixture = Fixture::new().await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_eq!(status(&report, Step::RoundTrip), StepStatus::Passed);

    let collection = paths::limited_support_reasons(INTERNAL_ID);
    let record = paths::limited_support_reason(INTERNAL_ID, RECORD_ID);
    assert_eq!(
        fixture.ocm.calls(),
        vec![
            ("post".to_string(), collection),
            ("get".to_string(), record.clone()),
            ("delete".to_string(), record),
        ]
    );
    assert!(report.probe("limited-support-reason").is_some());
}

#[tokio::test]
async fn test_record_mismatch_fails_and_still_deletes_once() {
    let fixture = Fixture {
        ocm: Arc::new(MockOcm::new().with_get_reply(GetReply::Fixed(json!({
            "id": RECORD_ID,
            "summary": "Something else",
            "details": "This is an automated e2e test for limited support functionality",
            "detection_type": "manual"
        })))),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    match report.verdict() {
        Verdict::Failed(reason) => assert!(reason.contains("summary"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        fixture.ocm.deletes(),
        vec![paths::limited_support_reason(INTERNAL_ID, RECORD_ID)]
    );
}

#[tokio::test]
async fn test_failed_ocm_get_skips_verification_and_deletes_once() {
    let fixture = Fixture {
        ocm: Arc::new(MockOcm::new().with_get_reply(GetReply::Fail)),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    assert!(matches!(status(&report, Step::RoundTrip), StepStatus::Skipped(_)));
    assert_eq!(status(&report, Step::FinalStability), StepStatus::Passed);
    assert_eq!(report.verdict(), Verdict::Passed);
    assert_eq!(fixture.ocm.deletes().len(), 1);
}

#[tokio::test]
async fn test_unparsable_ocm_get_fails_and_deletes_once() {
    let fixture = Fixture {
        ocm: Arc::new(MockOcm::new().with_get_reply(GetReply::InvalidJson)),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_failed_at(&report.verdict(), Step::RoundTrip);
    assert_eq!(fixture.ocm.deletes().len(), 1);
}

#[tokio::test]
async fn test_failed_delete_does_not_change_the_verdict() {
    let fixture = Fixture {
        ocm: Arc::new(MockOcm::new().failing_delete()),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_eq!(report.verdict(), Verdict::Passed);
    assert_eq!(fixture.ocm.deletes().len(), 1);
}

#[tokio::test]
async fn test_create_failure_skips_round_trip() {
    let fixture = Fixture {
        ocm: Arc::new(MockOcm::new().with_post_reply(PostReply::Fail)),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    assert!(matches!(
        status(&report, Step::RoundTrip),
        StepStatus::Skipped(reason) if reason.contains("ocm CLI")
    ));
    assert!(fixture.ocm.deletes().is_empty());
    assert_eq!(status(&report, Step::FinalStability), StepStatus::Passed);
}

#[tokio::test]
async fn test_reply_without_id_skips_round_trip() {
    let fixture = Fixture {
        ocm: Arc::new(
            MockOcm::new().with_post_reply(PostReply::Fixed(json!({ "kind": "Error" }))),
        ),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    assert!(matches!(status(&report, Step::RoundTrip), StepStatus::Skipped(_)));
    assert!(fixture.ocm.deletes().is_empty());
}

#[tokio::test]
async fn test_agent_timeout_during_round_trip_skips_and_deletes_once() {
    let mut fixture = Fixture::new().await;
    fixture.config.http_timeout = Duration::from_millis(300);
    Mock::given(method("GET"))
        .and(path(paths::limited_support_reasons(INTERNAL_ID)))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&fixture.server)
        .await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert!(matches!(
        status(&report, Step::RoundTrip),
        StepStatus::Skipped(reason) if reason.contains("did not answer")
    ));
    let listing = report.probe("limited-support-reasons").unwrap();
    assert!(matches!(listing.outcome, ProbeOutcome::Transport(_)));
    assert!(report.probe("limited-support-reason").is_none());

    let record = paths::limited_support_reason(INTERNAL_ID, RECORD_ID);
    assert_eq!(fixture.ocm.deletes(), vec![record]);
    assert_eq!(status(&report, Step::FinalStability), StepStatus::Passed);
    assert_eq!(report.verdict(), Verdict::Passed);
}

#[tokio::test]
async fn test_port_forward_unavailable_skips_the_run() {
    let fixture = Fixture {
        tunnel: Arc::new(StaticTunnel::failing()),
        ..Fixture::new().await
    };

    let report = fixture.harness(fixture.cluster()).run().await;

    assert!(matches!(report.verdict(), Verdict::Skipped(reason) if reason.contains("kubectl")));
    assert!(!report.reached(Step::HealthProbes));
    assert!(fixture.request_paths().await.is_empty());
}

#[tokio::test]
async fn test_liveness_timeout_is_fatal() {
    let fixture = Fixture::new().await;
    fixture.respond("GET", paths::LIVEZ, 503).await;

    let report = fixture.harness(fixture.cluster()).run().await;

    match report.verdict() {
        Verdict::Failed(reason) => {
            assert!(reason.contains("port forwarding should be ready"), "{reason}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!report.reached(Step::HealthProbes));
}

#[tokio::test]
async fn test_unready_agent_fails_health_probes() {
    let fixture = Fixture::new().await;
    fixture.respond("GET", paths::READYZ, 503).await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_failed_at(&report.verdict(), Step::HealthProbes);
    assert!(fixture.ocm.calls().is_empty());
}

#[tokio::test]
async fn test_served_invalid_path_fails_negative_probe() {
    let fixture = Fixture::new().await;
    fixture.respond("GET", paths::INVALID, 200).await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_failed_at(&report.verdict(), Step::NegativeProbe);
}

#[tokio::test]
async fn test_missing_metrics_endpoint_fails() {
    let fixture = Fixture::new().await;
    fixture.respond("GET", paths::METRICS, 404).await;

    let report = fixture.harness(fixture.cluster()).run().await;

    assert_failed_at(&report.verdict(), Step::MetricsProbe);
}

#[tokio::test]
async fn test_restarting_container_fails_startup_verification() {
    let fixture = Fixture::new().await;
    let mut pod = running_pod("ocm-agent-crashy");
    pod.containers[0].restart_count = 3;
    let cluster = fixture
        .cluster()
        .without_pods()
        .with_pod(&fixture.config.namespace, pod);

    let report = fixture.harness(cluster).run().await;

    match report.verdict() {
        Verdict::Failed(reason) => assert!(reason.contains("restarted 3 times"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_no_running_pod_fails_target_selection() {
    let fixture = Fixture::new().await;
    let mut pod = running_pod("ocm-agent-pending");
    pod.phase = PodPhase::Pending;
    let cluster = fixture
        .cluster()
        .without_pods()
        .with_pod(&fixture.config.namespace, pod);

    let report = fixture.harness(cluster).run().await;

    assert_failed_at(&report.verdict(), Step::TargetSelection);
    assert_eq!(fixture.tunnel.open_count(), 0);
}

/// Runs with a real forwarding process: a stub script stands in for kubectl
/// and the harness still talks to the wiremock agent.
#[cfg(target_os = "linux")]
mod forwarding_process {
    use super::*;
    use async_trait::async_trait;
    use ocm_agent_e2e::fixtures::port_forward::{PortForward, PortForwardError, Tunnel};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use serial_test::serial;
    use std::sync::Mutex;

    struct StubKubectl {
        script: PathBuf,
        agent_url: String,
        pids: Mutex<Vec<u32>>,
    }

    impl StubKubectl {
        /// Write an executable script that ignores its arguments and sleeps.
        fn install(name: &str, agent_url: String) -> Self {
            let script = std::env::temp_dir().join(format!(
                "ocm-e2e-kubectl-{name}-{}",
                std::process::id()
            ));
            std::fs::write(&script, "#!/bin/sh\nexec sleep 60\n").unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

            Self {
                script,
                agent_url,
                pids: Mutex::new(Vec::new()),
            }
        }

        fn pids(&self) -> Vec<u32> {
            self.pids.lock().unwrap().clone()
        }
    }

    impl Drop for StubKubectl {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.script);
        }
    }

    #[async_trait]
    impl TunnelLauncher for StubKubectl {
        async fn open(&self, namespace: &str, pod: &str) -> Result<Tunnel, PortForwardError> {
            let process = PortForward::spawn(
                &self.script.to_string_lossy(),
                namespace,
                pod,
                &[(18081, 8081)],
            )?;
            self.pids.lock().unwrap().extend(process.pid());

            Ok(Tunnel {
                base_url: self.agent_url.clone(),
                metrics_base_url: self.agent_url.clone(),
                process: Some(process),
            })
        }
    }

    fn is_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[tokio::test]
    #[serial]
    async fn test_forwarding_process_is_reaped_after_passing_run() {
        let fixture = Fixture::new().await;
        let kubectl = Arc::new(StubKubectl::install("pass", fixture.server.uri()));

        let report = fixture
            .harness_with(fixture.cluster(), kubectl.clone())
            .run()
            .await;

        assert_eq!(report.verdict(), Verdict::Passed, "report: {report:?}");
        let pids = kubectl.pids();
        assert_eq!(pids.len(), 1);
        assert!(!is_alive(pids[0]), "port-forward {} still running", pids[0]);
    }

    #[tokio::test]
    #[serial]
    async fn test_forwarding_process_is_reaped_after_liveness_timeout() {
        let fixture = Fixture::new().await;
        fixture.respond("GET", paths::LIVEZ, 503).await;
        let kubectl = Arc::new(StubKubectl::install("livez", fixture.server.uri()));

        let report = fixture
            .harness_with(fixture.cluster(), kubectl.clone())
            .run()
            .await;

        assert_failed_at(&report.verdict(), Step::PortForward);
        let pids = kubectl.pids();
        assert_eq!(pids.len(), 1);
        assert!(!is_alive(pids[0]), "port-forward {} still running", pids[0]);
    }
}
