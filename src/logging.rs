//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` wins when set; otherwise `debug`
/// raises this crate's default level from info to debug.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(debug: bool) {
    let default_directive = if debug {
        "crawlflow=debug"
    } else {
        "crawlflow=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
