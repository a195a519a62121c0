//! Logging setup for the CLI.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CRATES: &[&str] = &[
    "furrow",
    "furrow_cli",
    "furrow_config",
    "furrow_planner",
    "furrow_providers",
    "furrow_vision",
];

/// Install the fmt subscriber. `RUST_LOG` directives are kept; the workspace
/// crates log at `debug` when verbose and `info` otherwise.
pub fn initialize_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = CRATES
        .iter()
        .filter_map(|name| format!("{}={}", name, level).parse().ok())
        .fold(EnvFilter::from_default_env(), |filter, directive| {
            filter.add_directive(directive)
        });

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
