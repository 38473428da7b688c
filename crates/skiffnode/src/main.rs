//! skiffnode — the Skiff node agent binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use skiffnode::{Agent, AgentConfig};

#[derive(Parser)]
#[command(name = "skiffnode")]
#[command(about = "Skiff node agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (register, heartbeat, sync config, supervise forwarder)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/skiffnode/config.yaml")]
        config: PathBuf,
    },

    /// Generate a starter config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/skiffnode/config.yaml")]
        output: PathBuf,

        /// Panel base URL
        #[arg(long, default_value = "https://panel.example.net")]
        panel_url: String,
    },

    /// Show system information for this node
    Info,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = match AgentConfig::load(&config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            init_tracing(&config.log.level);
            let agent = match Agent::new(config) {
                Ok(agent) => agent,
                Err(e) => {
                    eprintln!("failed to initialize agent: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = agent.run().await {
                error!(error = %e, "agent terminated");
                std::process::exit(2);
            }
        }
        Commands::InitConfig { output, panel_url } => {
            let config = AgentConfig::sample(panel_url);
            if let Err(e) = config.save(&output) {
                eprintln!("failed to write config: {e}");
                std::process::exit(1);
            }
            println!("Config written to {}", output.display());
            println!();
            println!("Add the node token issued by the panel, then run:");
            println!("  skiffnode run --config {}", output.display());
        }
        Commands::Info => system_info(),
    }
}

fn init_tracing(level: &str) {
    let directive = format!("{level},hyper=warn,reqwest=warn");
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
        .init();
}

fn system_info() {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_all();

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    println!("System Information:");
    println!();
    println!("  Hostname:  {hostname}");
    println!(
        "  OS:        {} {}",
        System::name().unwrap_or_default(),
        System::os_version().unwrap_or_default()
    );
    println!("  Kernel:    {}", System::kernel_version().unwrap_or_default());
    println!();
    println!("  CPUs:      {}", sys.cpus().len());
    println!(
        "  Memory:    {} / {} MB",
        sys.used_memory() / 1024 / 1024,
        sys.total_memory() / 1024 / 1024
    );
    println!("  Uptime:    {} seconds", System::uptime());
    println!();
    println!("  Agent:     skiffnode v{}", env!("CARGO_PKG_VERSION"));
}
