//! skiffpanel — the Skiff control plane service.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use skiff_panel::config::PanelConfig;
use skiff_panel::{AppState, build_router, run_command_sweeper, run_health_pruner};
use skiff_store::Store;

#[derive(Parser)]
#[command(name = "skiffpanel")]
#[command(about = "Skiff proxy-fleet control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the panel service
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/skiffpanel/config.yaml")]
        config: PathBuf,
    },

    /// Generate a starter config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/skiffpanel/config.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = match PanelConfig::load(&config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            init_tracing(&config.log.level);
            if let Err(e) = run(config).await {
                error!(error = %e, "panel terminated");
                std::process::exit(2);
            }
        }
        Commands::InitConfig { output } => {
            let config = PanelConfig::sample();
            if let Err(e) = config.save(&output) {
                eprintln!("failed to write config: {e}");
                std::process::exit(1);
            }
            println!("Config written to {}", output.display());
            println!();
            println!("Set admin_token, then run:");
            println!("  skiffpanel run --config {}", output.display());
        }
    }
}

fn init_tracing(level: &str) {
    let directive = format!("{level},sqlx=warn,tower_http=info");
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();
}

async fn run(config: PanelConfig) -> anyhow::Result<()> {
    info!(
        listen = %config.listen,
        database = %config.database_url,
        "starting skiffpanel"
    );

    let store = Store::open(&config.database_url).await?;
    let config = Arc::new(config);
    let state = AppState::new(store.clone(), config.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(state.health.clone().run_sweeper(shutdown_rx.clone()));
    tokio::spawn(run_command_sweeper(store.clone(), shutdown_rx.clone()));
    tokio::spawn(run_health_pruner(
        store.clone(),
        chrono::Duration::hours(config.health_retention_hours as i64),
        shutdown_rx.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(addr = %listener.local_addr()?, "panel listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    info!("panel stopped");
    Ok(())
}
