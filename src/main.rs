//! # Main: CLI Entry Point
//!
//! Routes subcommands to the control plane. `serve` runs the API together
//! with every background loop; the other subcommands run a single pass of
//! one loop and exit, which is how operators poke the system by hand.
//!
//! ## Global Options
//!
//! - `--config` / `FLEETMETER_CONFIG`: TOML settings file (missing = defaults).
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection, overrides the file.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "fleetmeter",
    version,
    about = "Schedule, reconcile and meter endpoints across execution clusters"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "FLEETMETER_CONFIG", default_value = "fleetmeter.toml")]
    config: PathBuf,

    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and all background loops
    Serve {
        /// Listen port (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply the database schema
    Migrate,
    /// Show which cluster would receive a new endpoint for a spec
    SelectCluster {
        /// Platform spec name
        #[arg(long)]
        spec: String,
        /// Preferred region
        #[arg(long, default_value = "")]
        region: String,
    },
    /// Run one worker reconciliation pass
    Reconcile,
    /// Run one metering cycle, or bill a single worker
    Bill {
        /// Bill only this worker
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Mark clusters with stale heartbeats offline
    SweepClusters,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = cli::load_config(&cli)?;
    let rt = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Serve { port } => rt.block_on(cli::run_serve(config, *port)),
        Commands::Migrate => rt.block_on(cli::run_migrate(&config)),
        Commands::SelectCluster { spec, region } => {
            rt.block_on(cli::run_select_cluster(&config, spec, region))
        }
        Commands::Reconcile => rt.block_on(cli::run_reconcile(&config)),
        Commands::Bill { worker_id } => rt.block_on(cli::run_bill(&config, worker_id.as_deref())),
        Commands::SweepClusters => rt.block_on(cli::run_sweep_clusters(&config)),
    }
}
