//! Logging setup.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ExporterError, ExporterResult};

/// Log target for scrape orchestration
pub const TARGET_SCRAPE: &str = "buildkit_exporter::scrape";
/// Log target for build client traffic
pub const TARGET_CLIENT: &str = "buildkit_exporter::client";
/// Log target for the HTTP server
pub const TARGET_SERVER: &str = "buildkit_exporter::server";

/// Map a configured level name to a filter; unknown names fall back to INFO.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber. `RUST_LOG` directives take precedence over
/// the configured level.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_current_span(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    installed.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("nonsense"), LevelFilter::INFO);
    }

    #[test]
    fn test_targets_are_filterable_per_module() {
        for target in [TARGET_SCRAPE, TARGET_CLIENT, TARGET_SERVER] {
            assert!(target.starts_with("buildkit_exporter::"));
            let directive = format!("{}=debug", target);
            assert!(directive
                .parse::<tracing_subscriber::filter::Directive>()
                .is_ok());
        }
        assert_ne!(TARGET_SCRAPE, TARGET_CLIENT);
        assert_ne!(TARGET_CLIENT, TARGET_SERVER);
    }
}
