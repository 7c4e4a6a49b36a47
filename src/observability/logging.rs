//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global tracing subscriber
//! - Select pretty or JSON output from config
//!
//! # Design Decisions
//! - `RUST_LOG` overrides the configured level when set
//! - Initialization is idempotent so tests and embedders can call it freely

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use crate::config::{LogFormat, ObservabilityConfig};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(level: &str) -> String {
    format!("forward_proxy={level},tower_http={level}")
}

pub fn init_logging(config: &ObservabilityConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));

        let layer = match config.log_format {
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed(),
            LogFormat::Pretty => fmt::layer().with_target(true).with_filter(filter).boxed(),
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            level = %config.log_level,
            format = ?config.log_format,
            "Logging initialized"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("debug"), "forward_proxy=debug,tower_http=debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
