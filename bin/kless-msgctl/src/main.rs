//! ---
//! kless_section: "05-networking-external-interfaces"
//! kless_subsection: "binary"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Control CLI exercising the messaging core."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kless_common::{init_tracing, AppConfig};
use tracing::warn;

mod demo;

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] = ["configs/kless.toml", "kless.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Kless wallet messaging control utility",
    long_about = None
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "KLESS_CONFIG",
        help = "Configuration file (defaults to configs/kless.toml when present)"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List every payload type with its role")]
    Registry,
    #[command(about = "Run a UI and a background context and query pending permissions")]
    Demo(demo::DemoArgs),
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_path(path),
        None => match AppConfig::load(&DEFAULT_CONFIG_CANDIDATES[..]) {
            Ok(config) => Ok(config),
            Err(err) => {
                // tracing is not up yet
                eprintln!("{err:#}; using built-in defaults");
                Ok(AppConfig::default())
            }
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing("kless-msgctl", &config.logging)?;

    match cli.command {
        Commands::Registry => print_registry(),
        Commands::Demo(args) => {
            if let Err(err) = demo::run(&config, args).await {
                warn!(error = %err, "demo failed");
                return Err(err);
            }
        }
    }
    Ok(())
}

fn print_registry() {
    let registry = kless_msg::PayloadRegistry::standard();
    for descriptor in registry.variants() {
        println!("{:<30} {}", descriptor.tag, descriptor.style);
    }
}
