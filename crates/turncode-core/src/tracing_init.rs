//! Shared tracing/logging initialization.
//!
//! Logs always go to stderr: the `turncode` binary reserves stdout for JSON
//! results, and child process output is captured separately.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive enabling both turncode crates at `level`.
pub fn default_filter(level: &str) -> String {
    format!("turncode_core={level},turncode_runner={level},turncode={level}")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is unset or invalid
///   (e.g. the output of [`default_filter`]).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Installing twice is harmless; hosts that already own a subscriber keep it.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let installed = if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
