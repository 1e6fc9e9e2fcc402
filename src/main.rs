use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use screening_orchestrator::{
    cli::{execute_command, Commands},
    config::Config,
    engine::PipeClient,
    files::LocalFileStore,
    storage::SqliteStorage,
    SessionManager, Sweeper,
};

/// Screening session administration
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Screening orchestrator starting..."
    );

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    // Initialize conversational engine client
    let engine = match PipeClient::new(&config.engine, config.request.clone(), config.pipes.clone()) {
        Ok(c) => {
            info!(base_url = %config.engine.base_url, "Engine client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize engine client");
            return Err(e.into());
        }
    };

    let files = LocalFileStore::new(&config.capture.media_dir);
    let manager = Arc::new(SessionManager::new(
        storage,
        Arc::new(engine),
        Arc::new(files),
        config.session.clone(),
    ));
    let sweeper = Sweeper::new(Arc::clone(&manager), &config.capture);

    if let Commands::Sweep { once: false } = cli.command {
        info!("Sweeping until interrupted...");
        sweeper
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
            })
            .await;
        info!("Shutdown complete");
        return Ok(());
    }

    let result = execute_command(cli.command, &manager, &sweeper).await;
    if result.exit_code == 0 {
        print!("{}", result.message);
    } else {
        eprint!("{}", result.message);
    }
    std::process::exit(result.exit_code);
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        screening_orchestrator::config::LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        screening_orchestrator::config::LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
