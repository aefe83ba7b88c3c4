//! Logging initialization for the socket engine.
//!
//! The engine logs through `tracing` macros; nothing is printed until one of
//! these functions installs a subscriber. `RUST_LOG` always wins over the
//! level passed in code:
//!
//! ```bash
//! RUST_LOG=etude_core=debug etude-server
//! ```
//!
//! Severity mapping used throughout the crate: resource exhaustion and setup
//! failures log at `error`, admission rejections and dropped sends at `warn`,
//! lifecycle and kicks at `info`, per-connection churn at `debug`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a specific default level, e.g. the `LogLevel`
/// configuration value.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Initialize JSON-formatted logging for log aggregation.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_json(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
