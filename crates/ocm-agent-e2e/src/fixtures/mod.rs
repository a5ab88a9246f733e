//! Clients for the processes and services a run talks to.

pub mod agent_client;
pub mod ocm_api;
pub mod ocm_cli;
pub mod port_forward;

pub use agent_client::AgentClient;
pub use ocm_api::OcmApiClient;
pub use ocm_cli::OcmCli;
pub use port_forward::{KubectlPortForward, PortForward};
