//! Harness configuration.
//!
//! Every setting defaults to the values used by the OSD e2e pipeline and can be
//! overridden through an `OCM_E2E_*` environment variable.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Namespace the ocm-agent operator deploys into.
pub const DEFAULT_NAMESPACE: &str = "openshift-ocm-agent-operator";

/// Name of the agent deployment. The operator deployment is this plus `-operator`.
pub const DEFAULT_DEPLOYMENT: &str = "ocm-agent";

pub const DEFAULT_CONFIGMAP: &str = "ocm-agent-cm";
pub const DEFAULT_SECRET: &str = "ocm-access-token";
pub const DEFAULT_LABEL_SELECTOR: &str = "app=ocm-agent";

/// Agent HTTP port, forwarded to the same local port.
pub const DEFAULT_SERVICE_PORT: u16 = 8081;

/// Agent metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 8383;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Restarts tolerated per container before the pod is considered unstable.
pub const DEFAULT_MAX_RESTARTS: i32 = 2;

/// Keys read from the agent ConfigMap.
pub mod keys {
    pub const CLUSTER_ID: &str = "clusterID";
    pub const OCM_BASE_URL: &str = "ocmBaseURL";
    pub const SERVICES: &str = "services";

    /// Key read from the access token Secret.
    pub const ACCESS_TOKEN: &str = "access_token";
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Settings for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub namespace: String,
    /// Deployments that must be available, checked in order.
    pub deployments: Vec<String>,
    pub configmap: String,
    pub secret: String,
    pub label_selector: String,
    /// Local end of the agent port-forward.
    pub local_port: u16,
    /// Agent container port.
    pub remote_port: u16,
    /// Metrics port, forwarded 1:1.
    pub metrics_port: u16,
    pub http_timeout: Duration,
    pub max_restarts: i32,
    pub kubectl_bin: String,
    pub ocm_bin: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            deployments: vec![
                DEFAULT_DEPLOYMENT.to_string(),
                format!("{DEFAULT_DEPLOYMENT}-operator"),
            ],
            configmap: DEFAULT_CONFIGMAP.to_string(),
            secret: DEFAULT_SECRET.to_string(),
            label_selector: DEFAULT_LABEL_SELECTOR.to_string(),
            local_port: DEFAULT_SERVICE_PORT,
            remote_port: DEFAULT_SERVICE_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            max_restarts: DEFAULT_MAX_RESTARTS,
            kubectl_bin: "kubectl".to_string(),
            ocm_bin: "ocm".to_string(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let string_or = |var: &str, default: String| -> String {
            vars.get(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        let deployments = match vars.get("OCM_E2E_DEPLOYMENTS") {
            Some(list) => {
                let names: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
                if names.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        var: "OCM_E2E_DEPLOYMENTS".to_string(),
                        message: "at least one deployment name is required".to_string(),
                    });
                }
                names
            }
            None => defaults.deployments,
        };

        let http_timeout = parse_var::<u64>(vars, "OCM_E2E_HTTP_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        Ok(Self {
            namespace: string_or("OCM_E2E_NAMESPACE", defaults.namespace),
            deployments,
            configmap: string_or("OCM_E2E_CONFIGMAP", defaults.configmap),
            secret: string_or("OCM_E2E_SECRET", defaults.secret),
            label_selector: string_or("OCM_E2E_LABEL_SELECTOR", defaults.label_selector),
            local_port: parse_var(vars, "OCM_E2E_LOCAL_PORT")?.unwrap_or(defaults.local_port),
            remote_port: parse_var(vars, "OCM_E2E_REMOTE_PORT")?.unwrap_or(defaults.remote_port),
            metrics_port: parse_var(vars, "OCM_E2E_METRICS_PORT")?
                .unwrap_or(defaults.metrics_port),
            http_timeout,
            max_restarts: parse_var(vars, "OCM_E2E_MAX_RESTARTS")?
                .unwrap_or(defaults.max_restarts),
            kubectl_bin: string_or("OCM_E2E_KUBECTL", defaults.kubectl_bin),
            ocm_bin: string_or("OCM_E2E_OCM_CLI", defaults.ocm_bin),
        })
    }

    /// Base URL of the forwarded agent HTTP surface.
    pub fn agent_base_url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }

    /// Base URL of the forwarded metrics port.
    pub fn metrics_base_url(&self) -> String {
        format!("http://localhost:{}", self.metrics_port)
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(var).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
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
    fn test_from_vars_defaults() {
        let config = HarnessConfig::from_vars(&HashMap::new()).expect("defaults should load");

        assert_eq!(config.namespace, "openshift-ocm-agent-operator");
        assert_eq!(config.deployments, vec!["ocm-agent", "ocm-agent-operator"]);
        assert_eq!(config.configmap, "ocm-agent-cm");
        assert_eq!(config.secret, "ocm-access-token");
        assert_eq!(config.label_selector, "app=ocm-agent");
        assert_eq!(config.local_port, 8081);
        assert_eq!(config.remote_port, 8081);
        assert_eq!(config.metrics_port, 8383);
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.max_restarts, 2);
        assert_eq!(config.agent_base_url(), "http://localhost:8081");
        assert_eq!(config.metrics_base_url(), "http://localhost:8383");
    }

    #[test]
    fn test_from_vars_overrides() {
        let vars = HashMap::from([
            ("OCM_E2E_NAMESPACE".to_string(), "agent-ns".to_string()),
            (
                "OCM_E2E_DEPLOYMENTS".to_string(),
                " ocm-agent , , custom-operator ".to_string(),
            ),
            ("OCM_E2E_LOCAL_PORT".to_string(), "18081".to_string()),
            ("OCM_E2E_HTTP_TIMEOUT_SECS".to_string(), "5".to_string()),
            ("OCM_E2E_OCM_CLI".to_string(), "/usr/local/bin/ocm".to_string()),
        ]);

        let config = HarnessConfig::from_vars(&vars).expect("overrides should load");

        assert_eq!(config.namespace, "agent-ns");
        assert_eq!(config.deployments, vec!["ocm-agent", "custom-operator"]);
        assert_eq!(config.local_port, 18081);
        assert_eq!(config.remote_port, 8081);
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert_eq!(config.ocm_bin, "/usr/local/bin/ocm");
        assert_eq!(config.agent_base_url(), "http://localhost:18081");
    }

    #[test]
    fn test_from_vars_blank_value_falls_back_to_default() {
        let vars = HashMap::from([("OCM_E2E_SECRET".to_string(), "   ".to_string())]);

        let config = HarnessConfig::from_vars(&vars).unwrap();
        assert_eq!(config.secret, "ocm-access-token");
    }

    #[test]
    fn test_from_vars_invalid_port() {
        let vars = HashMap::from([("OCM_E2E_LOCAL_PORT".to_string(), "70000".to_string())]);

        let result = HarnessConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "OCM_E2E_LOCAL_PORT")
        );
    }

    #[test]
    fn test_from_vars_empty_deployment_list() {
        let vars = HashMap::from([("OCM_E2E_DEPLOYMENTS".to_string(), " , ".to_string())]);

        let result = HarnessConfig::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue { var, .. }) if var == "OCM_E2E_DEPLOYMENTS")
        );
    }
}
