//! Logging setup for the mesh core.
//!
//! Structured logging via `tracing`; the `RUST_LOG` environment variable
//! refines the filter at runtime.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `default_directive` is used when `RUST_LOG` is unset, e.g. `"info"` or
/// `"bitchat_mesh=debug"`. Safe to call more than once; later calls are
/// no-ops.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
