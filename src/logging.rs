//! Logging initialization for binaries and tests.

use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_INIT: Once = Once::new();

/// Install the global tracing subscriber once. `RUST_LOG` overrides the
/// given default directive.
pub fn init(default: &str) {
    LOG_INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    });
}
