use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "idra", version, about = "Local agent fleet orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator in the foreground
    Run {
        /// Agents directory (default: agents/ next to the binary, then ./agents)
        #[arg(long)]
        agents_dir: Option<PathBuf>,

        /// HTTP port for this run (overrides the configured port)
        #[arg(long)]
        port: Option<u16>,

        /// Path to config file (overrides the platform default)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
