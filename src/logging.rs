//! Optional tracing setup for embedders that do not install their own
//! subscriber.

use tracing_subscriber::EnvFilter;

/// Initialises a global `tracing` subscriber honouring `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
