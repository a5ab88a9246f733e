//! Error taxonomy and the tagged per-step result.
//!
//! Harness steps never use errors for control flow. Each step returns a
//! [`StepResult`] that says whether the run continues (`Ok`), drops the checks
//! that depend on this step (`Skip`), or aborts (`Fatal`).

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::fixtures::agent_client::AgentClientError;
use crate::fixtures::ocm_api::UpstreamError;
use crate::fixtures::ocm_cli::CliError;
use crate::fixtures::port_forward::PortForwardError;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// Maximum length for an error body or CLI output quoted in a message.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Regex pattern for JWT tokens (header.payload.signature).
#[allow(clippy::expect_used)]
static JWT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]*)?")
        .expect("JWT pattern is a valid regex")
});

/// Regex pattern for Bearer credentials in text.
#[allow(clippy::expect_used)]
static BEARER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").expect("Bearer pattern is a valid regex")
});

/// Remove credentials from text that is about to be logged or put in an error.
///
/// Bearer headers go first so `Bearer <JWT>` is redacted as a whole, then any
/// standalone JWT. The result is truncated to `MAX_ERROR_BODY_LEN` characters.
pub fn sanitize_error_body(body: &str) -> String {
    let sanitized = BEARER_PATTERN.replace_all(body, "[BEARER_REDACTED]");
    let sanitized = JWT_PATTERN.replace_all(&sanitized, "[JWT_REDACTED]");

    if sanitized.chars().count() > MAX_ERROR_BODY_LEN {
        let truncated: String = sanitized.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{truncated}...[truncated]")
    } else {
        sanitized.into_owned()
    }
}

/// Every way a harness step can go wrong.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// The environment is not in the expected baseline state.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("OCM API error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("ocm CLI error: {0}")]
    Cli(#[from] CliError),

    #[error("Port-forward error: {0}")]
    PortForward(#[from] PortForwardError),

    #[error("Agent request failed: {0}")]
    Agent(#[from] AgentClientError),

    /// An observed value differs from what the agent must produce.
    #[error("Assertion failed: {0}")]
    Assertion(String),
}

impl HarnessError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }
}

/// Classified outcome of a single harness step.
#[must_use]
#[derive(Debug)]
pub enum StepResult<T> {
    /// The step succeeded; dependent checks may run.
    Ok(T),

    /// An upstream dependency was unavailable. Dependent checks are skipped,
    /// independent checks continue.
    Skip(String),

    /// The run must stop.
    Fatal(HarnessError),
}

impl<T> StepResult<T> {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    pub fn fatal(error: impl Into<HarnessError>) -> Self {
        Self::Fatal(error.into())
    }
}

/// Any error reaching a step boundary through `Result` is fatal by default.
impl<T, E> From<Result<T, E>> for StepResult<T>
where
    E: Into<HarnessError>,
{
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::Fatal(error.into()),
        }
    }
}

/// Downgrade an upstream failure to a skip with a diagnostic.
pub trait SkipOnError<T> {
    fn or_skip(self, context: &str) -> StepResult<T>;
}

impl<T, E> SkipOnError<T> for Result<T, E>
where
    E: fmt::Display,
{
    fn or_skip(self, context: &str) -> StepResult<T> {
        match self {
            Ok(value) => StepResult::Ok(value),
            Err(error) => StepResult::Skip(format!("{context}: {error}")),
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

    #[test]
    fn test_sanitize_removes_bearer_and_jwt() {
        let body = "denied for Bearer abc.def-123 and token eyJhbGciOi.eyJzdWIiOiJ4.sig";
        let sanitized = sanitize_error_body(body);

        assert!(sanitized.contains("[BEARER_REDACTED]"));
        assert!(sanitized.contains("[JWT_REDACTED]"));
        assert!(!sanitized.contains("abc.def-123"));
        assert!(!sanitized.contains("eyJhbGciOi"));
    }

    #[test]
    fn test_sanitize_truncates_long_bodies() {
        let body = "x".repeat(1000);
        let sanitized = sanitize_error_body(&body);

        assert!(sanitized.ends_with("...[truncated]"));
        assert_eq!(sanitized.len(), MAX_ERROR_BODY_LEN + "...[truncated]".len());
    }

    #[test]
    fn test_sanitize_keeps_short_plain_text() {
        assert_eq!(sanitize_error_body("not found"), "not found");
    }

    #[test]
    fn test_result_conversion_is_fatal() {
        let result: Result<u8, HarnessError> = Err(HarnessError::precondition("no namespace"));
        let step: StepResult<u8> = result.into();

        assert!(matches!(step, StepResult::Fatal(HarnessError::Precondition(_))));
    }

    #[test]
    fn test_or_skip_keeps_context() {
        let result: Result<u8, String> = Err("connection refused".to_string());
        let step = result.or_skip("OCM identity lookup");

        match step {
            StepResult::Skip(reason) => {
                assert_eq!(reason, "OCM identity lookup: connection refused");
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }
}
