//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the logging subsystem once per process
//! - Map the `--log.level` flag to a default filter directive
//! - Attach the optional `--debug.name` to every event
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` overrides the flag-derived filter when set
//! - Logs go to stderr; stdout stays free for command output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Filter directive for a log level name, as accepted by `--log.level`.
pub fn directive_for(level: &str) -> String {
    format!("chronostore={level},tower_http={level},{}", default_level(level))
}

fn default_level(level: &str) -> &'static str {
    match level {
        "error" => "error",
        "debug" => "info",
        _ => "warn",
    }
}

/// Install the global subscriber. Returns an error if one is already set.
///
/// The returned span carries the debug name; the entry sequencer runs the
/// process inside it and the actor group propagates it to every actor task.
pub fn init(config: &LogConfig) -> Result<tracing::Span, tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive_for(&config.level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    let span = match config.debug_name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => tracing::info_span!("process", name = %name),
        None => tracing::Span::none(),
    };
    Ok(span)
}
