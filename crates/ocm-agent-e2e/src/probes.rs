//! Probe catalogue and evaluation.
//!
//! A probe is one HTTP request against the forwarded agent plus the statuses it
//! may legitimately return. Proxy probes accept a small allow-set because the
//! backing records may not exist in OCM when the suite runs.

use crate::fixtures::agent_client::{paths, AgentClient, HttpReply, Port};
use reqwest::Method;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

pub const STATUS_OK: &[u16] = &[200];
pub const STATUS_NOT_FOUND: &[u16] = &[404];

/// Proxied reads: the record may exist, not exist, or the token may lack access.
pub const PROXY_READ_ALLOWED: &[u16] = &[200, 404, 401];

/// Proxied state change: as reads, plus the agent refusing the verb.
pub const PROXY_MUTATION_ALLOWED: &[u16] = &[200, 404, 401, 405];

/// Used when the cluster has no upgrade policy to address.
pub const PLACEHOLDER_POLICY_ID: &str = "ocm-agent-e2e-nonexistent-policy";

/// State written by the mutation probe.
pub const SCHEDULED_STATE: &str = "scheduled";

/// Budget for the timeout-sensitivity probe.
pub const TIMEOUT_PROBE_BUDGET: Duration = Duration::from_millis(1);

/// How much a probe's outcome counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTier {
    /// No response is tolerated; a response must carry an allowed status.
    Tolerant,
    /// A response with an allowed status is mandatory.
    Required,
    /// Recorded only, never fails.
    Observational,
}

/// What came back from one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Status(u16),
    Transport(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Status(status) => write!(f, "status {status}"),
            ProbeOutcome::Transport(error) => write!(f, "no response ({error})"),
        }
    }
}

/// Evaluation of an outcome against the probe's expectations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Accepted,
    /// Anomaly that does not fail the run.
    Tolerated(String),
    Rejected(String),
}

impl ProbeVerdict {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ProbeVerdict::Rejected(_))
    }
}

#[derive(Debug, Clone)]
pub struct Probe {
    pub name: String,
    pub method: Method,
    pub port: Port,
    pub path: String,
    pub body: Option<Value>,
    pub allowed: &'static [u16],
    pub tier: ProbeTier,
}

impl Probe {
    pub fn get(
        name: impl Into<String>,
        path: impl Into<String>,
        allowed: &'static [u16],
        tier: ProbeTier,
    ) -> Self {
        Self {
            name: name.into(),
            method: Method::GET,
            port: Port::Service,
            path: path.into(),
            body: None,
            allowed,
            tier,
        }
    }

    pub fn evaluate(&self, outcome: &ProbeOutcome) -> ProbeVerdict {
        match (outcome, self.tier) {
            (ProbeOutcome::Status(status), _) if self.allowed.contains(status) => {
                ProbeVerdict::Accepted
            }
            (_, ProbeTier::Observational) => {
                ProbeVerdict::Tolerated(format!("{}: {outcome}", self.name))
            }
            (ProbeOutcome::Transport(_), ProbeTier::Tolerant) => {
                ProbeVerdict::Tolerated(format!("{}: {outcome}", self.name))
            }
            (ProbeOutcome::Status(status), _) => ProbeVerdict::Rejected(format!(
                "{}: unexpected status {status}, expected one of {:?}",
                self.name, self.allowed
            )),
            (ProbeOutcome::Transport(error), ProbeTier::Required) => {
                ProbeVerdict::Rejected(format!("{}: no response: {error}", self.name))
            }
        }
    }
}

/// Record of one executed probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: String,
    pub method: Method,
    pub path: String,
    pub outcome: ProbeOutcome,
    pub verdict: ProbeVerdict,
}

/// Send the probe's request and evaluate the answer.
///
/// The reply is returned as well so callers can read the body (the policy
/// listing feeds the policy id of later probes).
pub async fn run_probe(client: &AgentClient, probe: &Probe) -> (ProbeResult, Option<HttpReply>) {
    let reply = client
        .send(probe.method.clone(), probe.port, &probe.path, probe.body.as_ref())
        .await;

    let (outcome, reply) = match reply {
        Ok(reply) => (ProbeOutcome::Status(reply.status), Some(reply)),
        Err(e) => (ProbeOutcome::Transport(e.to_string()), None),
    };
    let verdict = probe.evaluate(&outcome);

    let result = ProbeResult {
        name: probe.name.clone(),
        method: probe.method.clone(),
        path: probe.path.clone(),
        outcome,
        verdict,
    };
    (result, reply)
}

pub fn livez() -> Probe {
    Probe::get("livez", paths::LIVEZ, STATUS_OK, ProbeTier::Tolerant)
}

pub fn readyz() -> Probe {
    Probe::get("readyz", paths::READYZ, STATUS_OK, ProbeTier::Tolerant)
}

pub fn invalid_path() -> Probe {
    Probe::get(
        "invalid-endpoint",
        paths::INVALID,
        STATUS_NOT_FOUND,
        ProbeTier::Tolerant,
    )
}

/// Readiness under a starved timeout budget. Run with a client built with
/// [`TIMEOUT_PROBE_BUDGET`].
pub fn readyz_short_timeout() -> Probe {
    Probe::get(
        "readyz-short-timeout",
        paths::READYZ,
        STATUS_OK,
        ProbeTier::Observational,
    )
}

pub fn metrics() -> Probe {
    Probe {
        port: Port::Metrics,
        ..Probe::get("metrics", paths::METRICS, STATUS_OK, ProbeTier::Tolerant)
    }
}

/// Readiness after every other check; the run's closing health verdict.
pub fn final_readyz() -> Probe {
    Probe::get(
        "final-readyz",
        paths::READYZ,
        STATUS_OK,
        ProbeTier::Required,
    )
}

pub fn upgrade_policies(internal_id: &str) -> Probe {
    Probe::get(
        "upgrade-policies",
        paths::upgrade_policies(internal_id),
        PROXY_READ_ALLOWED,
        ProbeTier::Tolerant,
    )
}

/// Detail, state and state mutation for one policy.
pub fn upgrade_policy_probes(internal_id: &str, policy_id: &str) -> Vec<Probe> {
    vec![
        Probe::get(
            "upgrade-policy",
            paths::upgrade_policy(internal_id, policy_id),
            PROXY_READ_ALLOWED,
            ProbeTier::Tolerant,
        ),
        Probe::get(
            "upgrade-policy-state",
            paths::upgrade_policy_state(internal_id, policy_id),
            PROXY_READ_ALLOWED,
            ProbeTier::Tolerant,
        ),
        Probe {
            method: Method::PATCH,
            body: Some(json!({ "value": SCHEDULED_STATE })),
            ..Probe::get(
                "upgrade-policy-state-patch",
                paths::upgrade_policy_state(internal_id, policy_id),
                PROXY_MUTATION_ALLOWED,
                ProbeTier::Tolerant,
            )
        },
    ]
}

pub fn limited_support_reasons(internal_id: &str) -> Probe {
    Probe::get(
        "limited-support-reasons",
        paths::limited_support_reasons(internal_id),
        PROXY_READ_ALLOWED,
        ProbeTier::Tolerant,
    )
}

pub fn limited_support_reason(internal_id: &str, reason_id: &str) -> Probe {
    Probe::get(
        "limited-support-reason",
        paths::limited_support_reason(internal_id, reason_id),
        PROXY_READ_ALLOWED,
        ProbeTier::Tolerant,
    )
}

/// First policy id in an upgrade policy listing, if any.
pub fn first_policy_id(listing: &Value) -> Option<String> {
    listing
        .get("items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
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

    #[test]
    fn test_proxy_read_allow_set() {
        let probe = upgrade_policies("int-1");

        for status in [200, 404, 401] {
            assert_eq!(
                probe.evaluate(&ProbeOutcome::Status(status)),
                ProbeVerdict::Accepted
            );
        }
        assert!(probe.evaluate(&ProbeOutcome::Status(500)).is_rejected());
        assert!(probe.evaluate(&ProbeOutcome::Status(405)).is_rejected());
    }

    #[test]
    fn test_patch_accepts_method_not_allowed() {
        let probes = upgrade_policy_probes("int-1", "pol-1");
        let patch = probes
            .iter()
            .find(|p| p.method == Method::PATCH)
            .expect("patch probe");

        assert_eq!(patch.body, Some(json!({ "value": "scheduled" })));
        assert_eq!(
            patch.evaluate(&ProbeOutcome::Status(405)),
            ProbeVerdict::Accepted
        );
        assert!(patch.evaluate(&ProbeOutcome::Status(403)).is_rejected());
    }

    #[test]
    fn test_tolerant_probe_tolerates_transport_errors() {
        let verdict = livez().evaluate(&ProbeOutcome::Transport("connection refused".into()));
        assert!(matches!(verdict, ProbeVerdict::Tolerated(msg) if msg.contains("livez")));

        assert!(livez().evaluate(&ProbeOutcome::Status(503)).is_rejected());
    }

    #[test]
    fn test_required_probe_rejects_transport_errors() {
        let verdict = final_readyz().evaluate(&ProbeOutcome::Transport("timed out".into()));
        assert!(verdict.is_rejected());
    }

    #[test]
    fn test_observational_probe_never_rejects() {
        let probe = readyz_short_timeout();

        assert!(!probe
            .evaluate(&ProbeOutcome::Transport("timed out".into()))
            .is_rejected());
        assert!(!probe.evaluate(&ProbeOutcome::Status(503)).is_rejected());
    }

    #[test]
    fn test_negative_path_expects_not_found() {
        let probe = invalid_path();

        assert_eq!(
            probe.evaluate(&ProbeOutcome::Status(404)),
            ProbeVerdict::Accepted
        );
        assert!(probe.evaluate(&ProbeOutcome::Status(200)).is_rejected());
    }

    #[test]
    fn test_metrics_probe_targets_metrics_port() {
        assert_eq!(metrics().port, Port::Metrics);
        assert_eq!(metrics().path, "/metrics");
    }

    #[test]
    fn test_first_policy_id() {
        assert_eq!(
            first_policy_id(&json!({ "items": [{ "id": "p1" }, { "id": "p2" }] })).as_deref(),
            Some("p1")
        );
        assert_eq!(first_policy_id(&json!({ "items": [] })), None);
        assert_eq!(first_policy_id(&json!({ "kind": "Error" })), None);
    }
}
