//! Live Conformance Run
//!
//! Runs the full harness against the cluster in the current kubeconfig. Needs
//! `kubectl` and a logged-in `ocm` in PATH. Settings come from `OCM_E2E_*`
//! environment variables.

#![cfg(feature = "live")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use ocm_agent_e2e::observability::init_tracing;
use ocm_agent_e2e::{ConformanceHarness, HarnessConfig, Step, StepStatus, Verdict};
use serial_test::serial;

async fn harness() -> ConformanceHarness {
    init_tracing();
    let config = HarnessConfig::from_env().expect("OCM_E2E_* settings should be valid");

    ConformanceHarness::connect(config)
        .await
        .expect("Failed to connect to cluster - check kubeconfig")
}

#[tokio::test]
#[serial]
async fn test_agent_conformance() {
    let report = harness().await.run().await;

    for record in report.steps() {
        println!("{:<22} {:?}", record.step.to_string(), record.status);
    }

    match report.verdict() {
        Verdict::Passed => {}
        Verdict::Skipped(reason) => println!("run skipped: {reason}"),
        Verdict::Failed(reason) => panic!("ocm-agent conformance failed: {reason}"),
    }
}

#[tokio::test]
#[serial]
async fn test_agent_survives_repeated_runs() {
    let harness = harness().await;

    let first = harness.run().await;
    match first.verdict() {
        Verdict::Passed => {}
        Verdict::Skipped(reason) => {
            println!("first run skipped, not repeating: {reason}");
            return;
        }
        Verdict::Failed(reason) => panic!("first conformance run failed: {reason}"),
    }
    let second = harness.run().await;

    assert_eq!(
        second.status_of(Step::FinalStability),
        Some(&StepStatus::Passed),
        "agent should stay healthy across runs: {:?}",
        second.verdict()
    );
}
