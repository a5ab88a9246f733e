//! `kubectl port-forward` to the selected agent pod.
//!
//! The forwarding process is owned by a [`PortForward`] guard. The harness
//! registers [`PortForward::shutdown`] on its cleanup scope right after the
//! spawn; the guard's `Drop` only exists as a backstop if that never runs.

use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PortForwardError {
    #[error("failed to start {program} port-forward: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Guard for a running `kubectl port-forward` process.
#[derive(Debug)]
pub struct PortForward {
    target: String,
    child: Option<Child>,
}

impl PortForward {
    /// Start forwarding each `(local, remote)` pair to `pod/<pod>`.
    pub fn spawn(
        kubectl: &str,
        namespace: &str,
        pod: &str,
        ports: &[(u16, u16)],
    ) -> Result<Self, PortForwardError> {
        let target = format!("pod/{pod}");
        let mut args = vec!["port-forward".to_string(), target.clone()];
        args.extend(ports.iter().map(|(local, remote)| format!("{local}:{remote}")));
        args.extend(["-n".to_string(), namespace.to_string()]);

        let child = Command::new(kubectl)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PortForwardError::Spawn {
                program: kubectl.to_string(),
                source,
            })?;

        info!(
            target: "ocm_e2e.port_forward",
            pod = %pod,
            namespace = %namespace,
            pid = ?child.id(),
            "Started port-forward"
        );

        Ok(Self {
            target,
            child: Some(child),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Kill the process and reap it. Errors are logged, not returned.
    pub async fn shutdown(mut self) {
        let pid = self.pid();
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = child.kill().await {
            warn!(
                target: "ocm_e2e.port_forward",
                target_pod = %self.target,
                pid = ?pid,
                error = %e,
                "Failed to stop port-forward"
            );
            return;
        }

        debug!(
            target: "ocm_e2e.port_forward",
            target_pod = %self.target,
            pid = ?pid,
            "Stopped port-forward"
        );
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// A reachable path to the agent's service and metrics ports.
#[derive(Debug)]
pub struct Tunnel {
    pub base_url: String,
    pub metrics_base_url: String,
    /// Forwarding process to release when the run ends, if one was started.
    pub process: Option<PortForward>,
}

/// Opens a [`Tunnel`] to a pod.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn open(&self, namespace: &str, pod: &str) -> Result<Tunnel, PortForwardError>;
}

/// [`TunnelLauncher`] that forwards the service and metrics ports with kubectl.
///
/// Both ports go through one `kubectl port-forward` process. If either local
/// port is already bound, kubectl exits right away, `/livez` never answers and
/// the port-forward step fails once the liveness wait runs out. Free the local
/// ports, or move them with `OCM_E2E_LOCAL_PORT` and `OCM_E2E_METRICS_PORT`.
#[derive(Debug, Clone)]
pub struct KubectlPortForward {
    pub kubectl: String,
    /// `(local, remote)` pairs handed to kubectl.
    pub ports: Vec<(u16, u16)>,
    pub base_url: String,
    pub metrics_base_url: String,
}

impl KubectlPortForward {
    pub fn from_config(config: &crate::config::HarnessConfig) -> Self {
        Self {
            kubectl: config.kubectl_bin.clone(),
            ports: vec![
                (config.local_port, config.remote_port),
                (config.metrics_port, config.metrics_port),
            ],
            base_url: config.agent_base_url(),
            metrics_base_url: config.metrics_base_url(),
        }
    }
}

#[async_trait]
impl TunnelLauncher for KubectlPortForward {
    async fn open(&self, namespace: &str, pod: &str) -> Result<Tunnel, PortForwardError> {
        let process = PortForward::spawn(&self.kubectl, namespace, pod, &self.ports)?;

        Ok(Tunnel {
            base_url: self.base_url.clone(),
            metrics_base_url: self.metrics_base_url.clone(),
            process: Some(process),
        })
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
    use crate::config::HarnessConfig;

    #[test]
    fn test_launcher_forwards_service_and_metrics_ports() {
        let launcher = KubectlPortForward::from_config(&HarnessConfig::default());

        assert_eq!(launcher.ports, vec![(8081, 8081), (8383, 8383)]);
        assert_eq!(launcher.kubectl, "kubectl");
        assert_eq!(launcher.base_url, "http://localhost:8081");
        assert_eq!(launcher.metrics_base_url, "http://localhost:8383");
    }

    #[tokio::test]
    async fn test_missing_kubectl_is_spawn_error() {
        let launcher = KubectlPortForward {
            kubectl: "/nonexistent/kubectl".to_string(),
            ..KubectlPortForward::from_config(&HarnessConfig::default())
        };

        let err = launcher.open("ns", "pod").await.unwrap_err();
        assert!(matches!(err, PortForwardError::Spawn { .. }));
    }
}
