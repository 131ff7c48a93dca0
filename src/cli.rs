use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "mirrors", about = "A mirror site update orchestrator", version)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the update daemon in the foreground
    Daemon {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show the update state of all sites, or of one
    Status { id: Option<String> },
    /// Stop running plugins and shut down the daemon
    Kill,
    /// Validate the configuration and every site's schedule
    Check {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the end of a site's plugin log
    Log {
        id: String,
        #[arg(long, default_value_t = 15)]
        lines: usize,
    },
}
