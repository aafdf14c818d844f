//! Command-line interface.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::ExporterConfig;
use crate::error::ExporterResult;
use crate::{EXPORTER_NAME, EXPORTER_VERSION};

/// Prometheus exporter for BuildKit cache and build-history metrics
#[derive(Parser, Debug)]
#[command(
    name = "buildkit-exporter",
    version = EXPORTER_VERSION,
    about = "Prometheus exporter for BuildKit cache and build-history metrics",
    long_about = "Scrapes a BuildKit daemon's control API on every request and exposes \
                  disk-usage, build-history, step and duration metrics in the Prometheus \
                  text format."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        default_value = "buildkit-exporter.toml",
        env = "BUILDKIT_EXPORTER_CONFIG"
    )]
    pub config: PathBuf,

    /// Address to use for connecting to Buildkit
    #[arg(long = "buildkit-address", alias = "buildkit.address", global = true)]
    pub buildkit_address: Option<String>,

    /// Address to listen on for the metrics endpoint
    #[arg(long = "listen-address", alias = "web.listen-address", global = true)]
    pub listen_address: Option<String>,

    /// Path under which to expose metrics
    #[arg(long = "telemetry-path", alias = "web.telemetry-path", global = true)]
    pub telemetry_path: Option<String>,

    /// Include a frontend `label:<name>` attribute as a metric label.
    /// Repeat once per label.
    #[arg(long = "include-label", value_name = "NAME", global = true)]
    pub include_labels: Vec<String>,

    /// Log level override
    #[arg(short, long, env = "BUILDKIT_EXPORTER_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format override (pretty, compact, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the exporter (default)
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show exporter version and build info
    Version,
}

impl Cli {
    /// Apply flag overrides on top of file and environment configuration.
    pub fn apply_overrides(&self, config: &mut ExporterConfig) {
        if let Some(address) = &self.buildkit_address {
            config.buildkit.address = address.clone();
        }
        if let Some(address) = &self.listen_address {
            config.web.listen_address = address.clone();
        }
        if let Some(path) = &self.telemetry_path {
            config.web.telemetry_path = path.clone();
        }
        if !self.include_labels.is_empty() {
            config.metrics.include_labels = self.include_labels.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.logging.format = format.clone();
        }
    }

    /// Load the configuration file (defaults when absent), apply flags and
    /// validate the result.
    pub fn resolve_config(&self) -> ExporterResult<ExporterConfig> {
        let mut config = ExporterConfig::load_or_default(&self.config)?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }
}

// ----------------------------------------------------------------------------
// Subcommand handlers
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
pub fn handle_validate(cli: &Cli, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration: {}", cli.config.display());
    let config = cli.resolve_config()?;
    println!("Configuration is valid");

    if verbose {
        println!();
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!();
    println!("Summary:");
    println!("  Buildkit address: {}", config.buildkit.address);
    println!("  Listen address:   {}", config.web.listen_address);
    println!("  Telemetry path:   {}", config.web.telemetry_path);
    println!("  Scrape timeout:   {}s", config.web.scrape_timeout_secs);
    if config.metrics.include_labels.is_empty() {
        println!("  Included labels:  none");
    } else {
        println!("  Included labels:  {}", config.metrics.include_labels.join(", "));
    }
    Ok(())
}

/// Handle the generate-config subcommand
pub fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

/// Handle the version subcommand
pub fn handle_version() {
    println!("{} v{}", EXPORTER_NAME, EXPORTER_VERSION);
    println!("  Target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
    println!("  gRPC client: {}", if cfg!(feature = "grpc") { "enabled" } else { "disabled" });
}
