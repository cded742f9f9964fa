use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the fmt subscriber once per process. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init(service: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // try_init: tests may already have a global subscriber installed.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init();
    });

    info!(service, version = env!("CARGO_PKG_VERSION"), "telemetry initialized");
}
