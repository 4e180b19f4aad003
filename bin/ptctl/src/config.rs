//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Configuration subcommands of the control CLI."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use pt_common::{AppConfig, LoadedAppConfig};

const DEFAULT_CANDIDATES: [&str; 2] = ["pt.toml", "config/pt.toml"];

/// Dispatch entry point for configuration subcommands.
pub fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Check(cmd) => cmd.execute(),
        ConfigCommand::Default => print_default(),
    }
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Load and validate a configuration file.
    #[command(name = "check")]
    Check(CheckCommand),
    /// Print the built-in defaults as TOML.
    #[command(name = "default")]
    Default,
}

#[derive(Debug, Args)]
pub struct CheckCommand {
    /// Configuration file (falls back to PT_CONFIG, then ./pt.toml and ./config/pt.toml).
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,
}

impl CheckCommand {
    pub fn execute(self) -> Result<()> {
        let loaded = match self.config {
            Some(path) => read_config(&path)?,
            None => AppConfig::load_with_source(&DEFAULT_CANDIDATES)?,
        };
        let config = &loaded.config;
        println!("Configuration {} is valid", loaded.source.display());
        println!(
            "session: backend={} network={} reply_capacity={}",
            config.session.backend, config.session.network, config.session.reply_capacity
        );
        println!(
            "workers: threads={} queue={} overflow={:?}",
            config.workers.thread_count,
            config
                .workers
                .queue_capacity
                .map_or_else(|| "unbounded".to_owned(), |capacity| capacity.to_string()),
            config.workers.overflow
        );
        println!("rpc: timeout={}s", config.rpc.timeout.as_secs());
        Ok(())
    }
}

/// Read and validate one configuration file, ignoring `PT_CONFIG`.
pub fn read_config(path: &Path) -> Result<LoadedAppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {}", path.display()))?;
    let config: AppConfig = contents
        .parse()
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    Ok(LoadedAppConfig {
        config,
        source: path.to_path_buf(),
    })
}

fn print_default() -> Result<()> {
    let rendered =
        toml::to_string_pretty(&AppConfig::default()).context("failed to render default configuration")?;
    print!("{rendered}");
    Ok(())
}
