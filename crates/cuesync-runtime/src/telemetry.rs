//! Tracing subscriber setup for the conductor process

use tracing::level_filters::LevelFilter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Environment variable holding the log filter directives
pub const LOG_ENV: &str = "CUESYNC_LOG";

/// Filter from `CUESYNC_LOG`, falling back to `info`
pub fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy()
}

/// Install the global subscriber. Logs go to stderr, as JSON lines if `json`.
pub fn init(json: bool) -> Result<(), TryInitError> {
    let (text_layer, json_layer) = if json {
        let layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .with_filter(env_filter());
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter());
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .try_init()
}
