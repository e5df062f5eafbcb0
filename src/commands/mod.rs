pub mod agent;
pub mod utils;

use anyhow::Result;

use crate::cli::{Args, Commands};

/// Dispatch a parsed command line
pub fn run_command(args: Args) -> Result<()> {
    let config = args.config.as_deref();
    let verbose = args.verbose;

    match args.command {
        Commands::Init {
            endpoint,
            user_id,
            community_id,
            poll_interval,
            force,
        } => agent::init(config, endpoint, user_id, community_id, poll_interval, force, verbose),
        Commands::Start => agent::start(config, verbose),
        Commands::Status => agent::status(config, verbose),
        Commands::Modules => agent::modules(config, verbose),
        Commands::Backup { path } => agent::backup(config, path, verbose),
        Commands::Cleanup { forget_modules } => agent::cleanup(config, forget_modules, verbose),
    }
}
