//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs a fmt subscriber filtered by `RUST_LOG`, or by the configured
/// directive when `RUST_LOG` is unset.
///
/// Only the first call installs anything; later calls, and calls made
/// after another global subscriber was set, return `false`.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
