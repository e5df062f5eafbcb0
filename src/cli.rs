use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Relay Agent
///
/// Executes actions issued by a remote control plane on this machine through
/// a set of local modules, after a one-time credential ceremony.
#[derive(Parser, Debug)]
#[command(name = "relay-agent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the agent configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a new agent configuration
    Init {
        /// Control plane base URL
        #[arg(long)]
        endpoint: String,

        #[arg(long)]
        user_id: String,

        #[arg(long)]
        community_id: String,

        /// Polling interval in seconds
        #[arg(long, default_value = "30")]
        poll_interval: u64,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Run the agent in the foreground until Ctrl-C
    Start,
    /// Show configuration, agent state and store statistics
    Status,
    /// List modules recorded by previous runs
    Modules,
    /// Copy the agent store to a new location
    Backup {
        /// Destination directory for the copy (must not exist)
        path: PathBuf,
    },
    /// Remove expired sessions and challenges
    Cleanup {
        /// Also drop persisted module snapshots, resetting enabled flags
        #[arg(long)]
        forget_modules: bool,
    },
}
