// src/utils/logging.rs
use tracing_subscriber::{fmt, EnvFilter};

// HTTP internals are noisy at info during PDF downloads and LLM calls.
const DEFAULT_DIRECTIVES: &str = "info,reqwest=warn,hyper=warn,hyper_util=warn";

/// Installs the global subscriber. `RUST_LOG` overrides the default
/// directives; output goes to stderr so progress does not mix with
/// anything piped from stdout.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Logging initialised");
}
