//! Tracing setup for harness runs.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "ocm_e2e=info";

/// Set to `json` for one JSON object per event.
pub const LOG_FORMAT_VAR: &str = "OCM_E2E_LOG_FORMAT";

/// Install the global subscriber.
///
/// Safe to call more than once (every test calls it); only the first call
/// installs anything.
pub fn init_tracing() {
    let json = std::env::var(LOG_FORMAT_VAR).is_ok_and(|format| format == "json");

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_test_writer()))
        .try_init();
}
