//! Tracing subscriber setup for KEEL processes.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "keel_pg=info,keel_storage=info,keel_agents=info,warn";

/// Install the global subscriber.
///
/// Honors `RUST_LOG`. Output is JSON when `json` is set, human-readable
/// otherwise. Fails if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
}

/// `KEEL_LOG_JSON` (default: true)
pub fn json_from_env() -> bool {
    std::env::var("KEEL_LOG_JSON")
        .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
        .unwrap_or(true)
}
