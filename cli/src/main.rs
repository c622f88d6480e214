// meshlink: command-line front end for the mesh transport core
//
// Derive mesh keys, manage the config file and run in-memory mesh
// simulations.

mod config;
mod simulate;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshlink_core::{MeshKey, SERVICE_ID};
use simulate::{SimulationOptions, Topology};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "meshlink: offline peer-to-peer mesh transport", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive the mesh key for an invite secret and print its fingerprint
    DeriveKey {
        #[arg(short, long)]
        invite: String,
        /// PBKDF2 iterations (defaults to the configured value)
        #[arg(long)]
        iterations: Option<u32>,
    },
    /// Run an in-memory mesh and report deliveries
    Simulate {
        #[arg(short, long, default_value = "5")]
        nodes: usize,
        #[arg(short, long, value_enum, default_value = "line")]
        topology: Topology,
        #[arg(long, default_value = "5")]
        ttl: u8,
        #[arg(long, default_value = "meshlink-simulation")]
        invite: String,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::DeriveKey { invite, iterations } => cmd_derive_key(invite, iterations),
        Commands::Simulate {
            nodes,
            topology,
            ttl,
            invite,
        } => cmd_simulate(nodes, topology, ttl, invite).await,
        Commands::Config { action } => cmd_config(action),
    }
}

fn init_logging(
    verbose: bool,
    log_file: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let name = path
        .file_name()
        .context("Log file path has no file name")?;
    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn cmd_derive_key(invite: String, iterations: Option<u32>) -> Result<()> {
    let iterations = match iterations {
        Some(n) => n,
        None => config::load()?.security.kdf_iterations,
    };
    let key = MeshKey::derive_with_iterations(&invite, iterations)
        .context("Failed to derive mesh key")?;

    println!("{}", "Mesh Key".bold());
    println!("  Fingerprint: {}", key.fingerprint_hex().bright_cyan());
    println!("  Iterations:  {}", iterations);
    println!("  Service:     {}", SERVICE_ID);
    Ok(())
}

async fn cmd_simulate(nodes: usize, topology: Topology, ttl: u8, invite: String) -> Result<()> {
    let config = config::load()?;
    let options = SimulationOptions {
        nodes,
        topology,
        ttl,
        invite,
    };
    let tallies = simulate::run(&options, config).await?;
    simulate::print_report(&options, &tallies);
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::load()?;
            let json = config
                .to_json_string()
                .context("Failed to serialize config")?;
            println!("{}", json);
        }
        ConfigAction::Init { force } => {
            let path = config::config_file()?;
            config::init_at(&path, &meshlink_core::MeshConfig::default(), force)?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }
        ConfigAction::Path => {
            println!("{}", config::config_file()?.display());
        }
    }
    Ok(())
}
