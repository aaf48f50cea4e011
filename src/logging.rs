//! Log subscriber setup.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by the build script.
pub const BUILD_DATE: &str = env!("PATHTRACE_BUILD_DATE");

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true));
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }

    tracing::info!("pathtrace-device {} (built {})", VERSION, BUILD_DATE);
    true
}
