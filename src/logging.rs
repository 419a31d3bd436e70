//! Tracing subscriber setup for applications embedding the client

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"jpipflow=info"`).
///
/// Returns `false` when a global subscriber was already installed, which is the
/// normal case inside test binaries and host applications with their own setup.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}
