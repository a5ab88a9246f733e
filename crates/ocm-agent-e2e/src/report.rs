//! Per-run report of steps and probes.
//!
//! Every step the harness reaches leaves exactly one [`StepRecord`]. The
//! overall [`Verdict`] is derived from them: any failure fails the run, a
//! skip that ends the run early makes it skipped, anything else passes.

use crate::error::StepResult;
use crate::probes::{ProbeResult, ProbeVerdict};
use std::fmt;
use tracing::{error, info, warn};

/// The harness steps, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Preconditions,
    Configuration,
    Credentials,
    IdentityExchange,
    TargetSelection,
    PortForward,
    StartupVerification,
    HealthProbes,
    NegativeProbe,
    TimeoutProbe,
    MetricsProbe,
    ProxyProbes,
    RoundTrip,
    FinalStability,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Preconditions => "preconditions",
            Step::Configuration => "configuration",
            Step::Credentials => "credentials",
            Step::IdentityExchange => "identity-exchange",
            Step::TargetSelection => "target-selection",
            Step::PortForward => "port-forward",
            Step::StartupVerification => "startup-verification",
            Step::HealthProbes => "health-probes",
            Step::NegativeProbe => "negative-probe",
            Step::TimeoutProbe => "timeout-probe",
            Step::MetricsProbe => "metrics-probe",
            Step::ProxyProbes => "proxy-probes",
            Step::RoundTrip => "round-trip",
            Step::FinalStability => "final-stability",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Passed,
    /// Step passed but something worth reading happened (tolerated probe
    /// anomalies, timing observations).
    Observed(Vec<String>),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Default)]
pub struct Report {
    steps: Vec<StepRecord>,
    probes: Vec<ProbeResult>,
    /// Set when a skip ended the run before its last step.
    ended_by_skip: Option<String>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn probes(&self) -> &[ProbeResult] {
        &self.probes
    }

    pub fn status_of(&self, step: Step) -> Option<&StepStatus> {
        self.steps
            .iter()
            .find(|record| record.step == step)
            .map(|record| &record.status)
    }

    pub fn reached(&self, step: Step) -> bool {
        self.status_of(step).is_some()
    }

    /// Most recent result of the named probe.
    pub fn probe(&self, name: &str) -> Option<&ProbeResult> {
        self.probes.iter().rev().find(|probe| probe.name == name)
    }

    pub fn verdict(&self) -> Verdict {
        let failure = self.steps.iter().find_map(|record| match &record.status {
            StepStatus::Failed(reason) => Some(format!("{}: {reason}", record.step)),
            _ => None,
        });

        match (failure, &self.ended_by_skip) {
            (Some(reason), _) => Verdict::Failed(reason),
            (None, Some(reason)) => Verdict::Skipped(reason.clone()),
            (None, None) => Verdict::Passed,
        }
    }

    pub fn pass(&mut self, step: Step) {
        info!(target: "ocm_e2e.report", step = %step, "Step passed");
        self.push(step, StepStatus::Passed);
    }

    /// Record a pass, or an observation when `notes` is non-empty.
    pub fn pass_with_notes(&mut self, step: Step, notes: Vec<String>) {
        if notes.is_empty() {
            return self.pass(step);
        }
        for note in &notes {
            warn!(target: "ocm_e2e.report", step = %step, note = %note, "Step observation");
        }
        self.push(step, StepStatus::Observed(notes));
    }

    /// Record a skip of this step alone; later steps still run.
    pub fn skip(&mut self, step: Step, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(target: "ocm_e2e.report", step = %step, reason = %reason, "Step skipped");
        self.push(step, StepStatus::Skipped(reason));
    }

    /// Record a skip that ends the run.
    pub fn skip_run(&mut self, step: Step, reason: impl Into<String>) {
        let reason = reason.into();
        self.ended_by_skip = Some(format!("{step}: {reason}"));
        self.skip(step, reason);
    }

    pub fn fail(&mut self, step: Step, reason: impl fmt::Display) {
        let reason = reason.to_string();
        error!(target: "ocm_e2e.report", step = %step, reason = %reason, "Step failed");
        self.push(step, StepStatus::Failed(reason));
    }

    pub fn record_probe(&mut self, result: ProbeResult) {
        match &result.verdict {
            ProbeVerdict::Accepted => info!(
                target: "ocm_e2e.report",
                probe = %result.name,
                method = %result.method,
                path = %result.path,
                outcome = %result.outcome,
                "Probe accepted"
            ),
            ProbeVerdict::Tolerated(note) => warn!(
                target: "ocm_e2e.report",
                probe = %result.name,
                note = %note,
                "Probe anomaly tolerated"
            ),
            ProbeVerdict::Rejected(reason) => error!(
                target: "ocm_e2e.report",
                probe = %result.name,
                reason = %reason,
                "Probe rejected"
            ),
        }
        self.probes.push(result);
    }

    /// Record a step whose skip ends the run. Returns the value when the run
    /// may continue.
    pub fn gate<T>(&mut self, step: Step, result: StepResult<T>) -> Option<T> {
        match result {
            StepResult::Ok(value) => {
                self.pass(step);
                Some(value)
            }
            StepResult::Skip(reason) => {
                self.skip_run(step, reason);
                None
            }
            StepResult::Fatal(e) => {
                self.fail(step, e);
                None
            }
        }
    }

    /// Record a step whose skip only affects the steps depending on it.
    ///
    /// The outer `Option` is `None` when the run must stop; the inner one is
    /// `None` when the step was skipped.
    pub fn optional<T>(&mut self, step: Step, result: StepResult<T>) -> Option<Option<T>> {
        match result {
            StepResult::Ok(value) => {
                self.pass(step);
                Some(Some(value))
            }
            StepResult::Skip(reason) => {
                self.skip(step, reason);
                Some(None)
            }
            StepResult::Fatal(e) => {
                self.fail(step, e);
                None
            }
        }
    }

    fn push(&mut self, step: Step, status: StepStatus) {
        self.steps.push(StepRecord { step, status });
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
    use crate::error::HarnessError;

    #[test]
    fn test_all_passed() {
        let mut report = Report::new();
        report.pass(Step::Preconditions);
        report.pass_with_notes(Step::HealthProbes, vec![]);

        assert_eq!(report.verdict(), Verdict::Passed);
        assert_eq!(report.status_of(Step::HealthProbes), Some(&StepStatus::Passed));
    }

    #[test]
    fn test_failure_wins_over_skip() {
        let mut report = Report::new();
        report.skip(Step::IdentityExchange, "not registered");
        report.fail(Step::HealthProbes, "readyz: unexpected status 503");

        assert_eq!(
            report.verdict(),
            Verdict::Failed("health-probes: readyz: unexpected status 503".to_string())
        );
    }

    #[test]
    fn test_local_skip_does_not_skip_run() {
        let mut report = Report::new();
        report.skip(Step::RoundTrip, "ocm CLI unavailable");
        report.pass(Step::FinalStability);

        assert_eq!(report.verdict(), Verdict::Passed);
    }

    #[test]
    fn test_gate_skip_ends_run() {
        let mut report = Report::new();
        let value: Option<()> = report.gate(Step::PortForward, StepResult::skip("no kubectl"));

        assert!(value.is_none());
        assert_eq!(
            report.verdict(),
            Verdict::Skipped("port-forward: no kubectl".to_string())
        );
    }

    #[test]
    fn test_optional_skip_continues() {
        let mut report = Report::new();

        let outer = report.optional::<String>(Step::IdentityExchange, StepResult::skip("404"));
        assert_eq!(outer, Some(None));

        let outer = report.optional::<String>(
            Step::IdentityExchange,
            StepResult::fatal(HarnessError::precondition("boom")),
        );
        assert_eq!(outer, None);
    }
}
