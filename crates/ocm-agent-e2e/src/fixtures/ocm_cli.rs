//! Record workflow through the `ocm` CLI.
//!
//! The round-trip check creates a limited support reason directly in OCM, reads
//! it back through the agent's proxy, and deletes it again. Creation and
//! deletion go through the `ocm` CLI so they use the operator's credentials,
//! not the agent's.

use crate::error::sanitize_error_body;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const E2E_SUMMARY: &str = "E2E Test Limited Support";
pub const E2E_DETAILS: &str = "This is an automated e2e test for limited support functionality";
pub const DETECTION_MANUAL: &str = "manual";

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {verb} exited with {status}: {stderr}")]
    Failed {
        program: String,
        verb: String,
        status: String,
        stderr: String,
    },

    #[error("invalid JSON from ocm {verb}: {message}")]
    InvalidJson { verb: String, message: String },
}

impl CliError {
    /// The command ran but its output was not JSON.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Self::InvalidJson { .. })
    }
}

/// Body of a limited support reason as submitted to OCM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitedSupportReason {
    pub summary: String,
    pub details: String,
    pub detection_type: String,
}

impl LimitedSupportReason {
    /// The record the harness creates for its round trip.
    pub fn e2e() -> Self {
        Self {
            summary: E2E_SUMMARY.to_string(),
            details: E2E_DETAILS.to_string(),
            detection_type: DETECTION_MANUAL.to_string(),
        }
    }

    /// Compare against a record fetched from OCM.
    ///
    /// Only string fields present in `fetched` are compared; returns the name,
    /// expected and actual value of the first mismatch.
    pub fn first_mismatch(&self, fetched: &Value) -> Option<(&'static str, String, String)> {
        let fields = [
            ("summary", &self.summary),
            ("details", &self.details),
            ("detection_type", &self.detection_type),
        ];

        fields.into_iter().find_map(|(name, expected)| {
            fetched
                .get(name)
                .and_then(Value::as_str)
                .filter(|actual| *actual != expected.as_str())
                .map(|actual| (name, expected.clone(), actual.to_string()))
        })
    }
}

/// Extract the `id` of a record from an OCM JSON reply.
pub fn record_id(reply: &Value) -> Option<String> {
    reply
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// The three `ocm` verbs the workflow uses.
#[async_trait]
pub trait OcmCommand: Send + Sync {
    /// `ocm post <path>` with `body` on stdin; returns the parsed reply.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, CliError>;

    /// `ocm get <path>`; returns the parsed reply.
    async fn get(&self, path: &str) -> Result<Value, CliError>;

    /// `ocm delete <path>`.
    async fn delete(&self, path: &str) -> Result<(), CliError>;
}

/// [`OcmCommand`] backed by the `ocm` binary.
#[derive(Debug, Clone)]
pub struct OcmCli {
    program: String,
}

impl OcmCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, verb: &str, path: &str, stdin: Option<Vec<u8>>) -> Result<Vec<u8>, CliError> {
        debug!(target: "ocm_e2e.ocm_cli", verb = %verb, path = %path, "Running ocm");

        let spawn_error = |source| CliError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args([verb, path])
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input).await.map_err(spawn_error)?;
            // Closing stdin tells ocm the body is complete.
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;

        if !output.status.success() {
            return Err(CliError::Failed {
                program: self.program.clone(),
                verb: verb.to_string(),
                status: output.status.to_string(),
                stderr: sanitize_error_body(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        Ok(output.stdout)
    }

    fn parse(verb: &str, stdout: &[u8]) -> Result<Value, CliError> {
        serde_json::from_slice(stdout).map_err(|e| CliError::InvalidJson {
            verb: verb.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl OcmCommand for OcmCli {
    async fn post(&self, path: &str, body: &Value) -> Result<Value, CliError> {
        let input = serde_json::to_vec(body).map_err(|e| CliError::InvalidJson {
            verb: "post".to_string(),
            message: e.to_string(),
        })?;
        let stdout = self.run("post", path, Some(input)).await?;
        Self::parse("post", &stdout)
    }

    async fn get(&self, path: &str) -> Result<Value, CliError> {
        let stdout = self.run("get", path, None).await?;
        Self::parse("get", &stdout)
    }

    async fn delete(&self, path: &str) -> Result<(), CliError> {
        self.run("delete", path, None).await.map(|_| ())
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
    fn test_e2e_record_serialization() {
        let body = serde_json::to_value(LimitedSupportReason::e2e()).unwrap();

        assert_eq!(
            body,
            json!({
                "summary": "E2E Test Limited Support",
                "details": "This is an automated e2e test for limited support functionality",
                "detection_type": "manual"
            })
        );
    }

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&json!({ "id": "lsr-1" })).as_deref(), Some("lsr-1"));
        assert_eq!(record_id(&json!({ "id": "" })), None);
        assert_eq!(record_id(&json!({ "id": 42 })), None);
        assert_eq!(record_id(&json!({ "kind": "Error" })), None);
    }

    #[test]
    fn test_first_mismatch_matches_exactly() {
        let submitted = LimitedSupportReason::e2e();
        let fetched = json!({
            "id": "lsr-1",
            "summary": "E2E Test Limited Support",
            "details": "This is an automated e2e test for limited support functionality",
            "detection_type": "manual"
        });

        assert_eq!(submitted.first_mismatch(&fetched), None);
    }

    #[test]
    fn test_first_mismatch_reports_field() {
        let submitted = LimitedSupportReason::e2e();
        let fetched = json!({ "summary": "Something else", "detection_type": "manual" });

        let (field, expected, actual) = submitted.first_mismatch(&fetched).unwrap();
        assert_eq!(field, "summary");
        assert_eq!(expected, "E2E Test Limited Support");
        assert_eq!(actual, "Something else");
    }

    #[test]
    fn test_first_mismatch_ignores_absent_fields() {
        let submitted = LimitedSupportReason::e2e();
        assert_eq!(submitted.first_mismatch(&json!({ "id": "x" })), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let cli = OcmCli::new("/nonexistent/ocm-binary");

        let err = cli.get("/api/clusters_mgmt/v1/clusters").await.unwrap_err();

        assert!(matches!(err, CliError::Spawn { .. }));
        assert!(!err.is_parse_error());
    }
}
