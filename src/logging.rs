//! Logging setup.
//!
//! The engine and scoring emit `tracing` events; the serial layer uses `log`.
//! [`init`] installs one `tracing-subscriber` formatter for both: `log` records are
//! forwarded through the subscriber's log bridge.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Returns an error string if a subscriber is already installed or `level` is not a
/// valid filter directive.
pub fn init(level: &str) -> Result<(), String> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| format!("Invalid log level '{}': {}", level, e))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}

