//! Tracing subscriber setup for the service binary.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;

const DEFAULT_FILTER: &str = "scan_engine=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
