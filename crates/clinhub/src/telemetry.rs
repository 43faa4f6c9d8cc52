//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `default_directive`
/// when `RUST_LOG` is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)))
        .with(fmt::layer())
        .try_init()
        .is_ok()
}
