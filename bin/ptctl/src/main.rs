//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI for operators of the transport adapter."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pt_common::{init_tracing, LogFormat, LoggingConfig};
use pt_logging as logging;

mod config;
mod demo;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Transport adapter control utility",
    long_about = None
)]
struct Cli {
    /// Also write a rolling JSON log file into this directory.
    #[arg(long = "log-dir", value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand, about = "Configuration inspection")]
    Config(config::ConfigCommand),
    #[command(subcommand, about = "Smoke demos against the in-memory substrate")]
    Demo(demo::DemoCommand),
    #[command(about = "List registered substrate backends")]
    Backends,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.log_dir {
        Some(directory) => init_tracing(
            "ptctl",
            &LoggingConfig {
                directory: directory.clone(),
                format: LogFormat::Pretty,
                file_prefix: None,
            },
        )?,
        None => logging::init(),
    }
    match cli.command {
        Commands::Config(cmd) => config::run(cmd)?,
        Commands::Demo(cmd) => demo::run(cmd)?,
        Commands::Backends => {
            for backend in pt_substrate::registry::backends() {
                println!("{backend}");
            }
        }
    }
    Ok(())
}
