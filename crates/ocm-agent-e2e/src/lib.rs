//! Conformance harness for a deployed ocm-agent.
//!
//! Runs black-box liveness, readiness and proxy checks against the agent
//! running in an OpenShift cluster, through a `kubectl port-forward`, and
//! verifies one record round trip between the `ocm` CLI and the agent's OCM
//! proxy.
//!
//! # Features
//!
//! - `live`: enables `tests/00_live_cluster.rs`, which runs the harness
//!   against the cluster in the current kubeconfig.
//!
//! # Prerequisites for a live run
//!
//! 1. kubeconfig pointing at a cluster with ocm-agent installed
//! 2. `kubectl` and a logged-in `ocm` in PATH (or `OCM_E2E_KUBECTL` /
//!    `OCM_E2E_OCM_CLI`)
//!
//! # Usage
//!
//! ```bash
//! # Offline scenarios only (no default features)
//! cargo test -p ocm-agent-e2e
//!
//! # Against the live cluster
//! cargo test -p ocm-agent-e2e --features live
//! ```

pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod eventual;
pub mod fixtures;
pub mod harness;
pub mod mock;
pub mod observability;
pub mod probes;
pub mod report;

pub use config::HarnessConfig;
pub use error::{HarnessError, StepResult};
pub use harness::ConformanceHarness;
pub use report::{Report, Step, StepStatus, Verdict};
