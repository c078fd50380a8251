//! Log output for the binary.
//!
//! Library crates log through the `log` facade; the subscriber installed here
//! picks those records up and writes them to stderr, keeping stdout free for
//! protocol responses.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const ENV_LOG: &str = "LABLINK_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// `LABLINK_LOG`, then `RUST_LOG`, then `info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber. Safe to call more than once.
pub fn init() {
    let registry = tracing_subscriber::registry().with(env_filter());

    #[cfg(feature = "logs-json")]
    let result = registry
        .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
        .try_init();

    #[cfg(not(feature = "logs-json"))]
    let result = registry
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init();

    if let Err(e) = result {
        log::debug!("logging already initialised: {}", e);
    }
}
