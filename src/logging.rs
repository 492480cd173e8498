#![forbid(unsafe_code)]

//! Structured logging setup. `RUST_LOG` wins over the verbosity flag.

use tracing_subscriber::EnvFilter;

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "tubesync=debug" } else { "tubesync=info" }
}

/// Installs the global fmt subscriber. Calling it twice is harmless.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
