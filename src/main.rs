//! Buildkit exporter binary.

use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use buildkit_exporter::catalog::Catalog;
use buildkit_exporter::cli::{self, Cli, Commands};
use buildkit_exporter::client::{BuildClient, GrpcBuildClient};
use buildkit_exporter::logging::{init_logging, TARGET_SERVER};
use buildkit_exporter::scrape::ScrapeCoordinator;
use buildkit_exporter::server::{self, AppState};
use buildkit_exporter::{EXPORTER_NAME, EXPORTER_VERSION};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need a running exporter
    match &cli.command {
        Some(Commands::Version) => {
            cli::handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            cli::handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            cli::handle_validate(&cli, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config = cli
        .resolve_config()
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    init_logging(&config.logging)?;

    info!(
        target: TARGET_SERVER,
        version = EXPORTER_VERSION,
        "Starting {}", EXPORTER_NAME
    );
    if !cli.config.exists() {
        warn!(
            target: TARGET_SERVER,
            path = %cli.config.display(),
            "Config file not found, using defaults"
        );
    }
    info!(
        target: TARGET_SERVER,
        buildkit = %config.buildkit.address,
        listen = %config.web.listen_address,
        include_labels = ?config.metrics.include_labels,
        "Configuration loaded"
    );

    let client: Arc<dyn BuildClient> = Arc::new(
        GrpcBuildClient::connect_lazy(&config.buildkit)
            .context("Failed to set up Buildkit client")?,
    );
    let catalog = Arc::new(Catalog::new(&config.metrics)?);
    let coordinator = Arc::new(ScrapeCoordinator::new(
        client,
        catalog,
        config.buildkit.early_exit,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let state = AppState::new(coordinator, &config.web, shutdown);
    server::serve(&config.web.listen_address, state)
        .await
        .context("HTTP server failed")?;

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: TARGET_SERVER, error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => info!(target: TARGET_SERVER, "Received SIGINT"),
        _ = terminate => info!(target: TARGET_SERVER, "Received SIGTERM"),
    }
    shutdown.cancel();
}
