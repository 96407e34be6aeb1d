//! Tracing subscriber setup for applications embedding the router.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Builds the filter: `RUST_LOG` wins when set, otherwise the configured level applies to
/// this crate and everything else logs at `warn`.
#[must_use]
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(directive) if directive == "debug" || directive == "trace" => {
            EnvFilter::new(format!("warn,switchboard_core={directive}"))
        }
        Ok(_) => EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(format!("warn,switchboard_core={}", config.level))),
        Err(_) => EnvFilter::new(format!("warn,switchboard_core={}", config.level)),
    }
}

/// Installs the global subscriber with a JSON or pretty formatter.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) {
    let registry = tracing_subscriber::registry().with(build_filter(config));

    let result = if config.format.as_str() == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer().json();
        registry.with(fmt_layer).try_init()
    } else {
        // "pretty" and any other format default to pretty logging
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).try_init()
    };

    if result.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
