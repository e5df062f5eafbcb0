use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::agent::{self, AgentState};
use crate::auth::Authenticator;
use crate::config::AgentConfig;
use crate::modules::persisted_descriptors;
use crate::store::BUCKET_MODULES;

use super::utils::{format_bytes, format_duration, init_logging, load_config, resolve_config_path};

/// Write a new agent configuration
pub fn init(
    config_path: Option<&Path>,
    endpoint: String,
    user_id: String,
    community_id: String,
    poll_interval: u64,
    force: bool,
    verbose: bool,
) -> Result<()> {
    init_logging(verbose, None);

    println!("Relay Agent - Setup");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    let path = resolve_config_path(config_path)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {}. Use --force to overwrite it.",
            path.display()
        );
    }

    let mut config = AgentConfig::new(&endpoint, &user_id, &community_id);
    config.server.poll_interval = poll_interval;
    config.validate().context("Invalid configuration")?;

    config.save(&path)?;
    println!("✓ Configuration saved to: {}", path.display());

    println!();
    println!("Next steps:");
    println!("  1. Start the agent:");
    println!("     relay-agent start");
    println!("  2. Register this machine at:");
    println!("     http://{}:{}/", config.web.host, config.web.port);
    println!();
    println!("The agent will poll for actions every {} seconds once registered.", poll_interval);

    Ok(())
}

/// Run the agent in the foreground
pub fn start(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let path = resolve_config_path(config_path)?;
    let config = load_config(&path)?;
    init_logging(verbose, Some(&config.logging.level));

    println!("Starting agent in foreground mode...");
    println!("Press Ctrl+C to stop");
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(agent::run_agent_daemon(config))
}

/// Show configuration, agent state and store statistics
pub fn status(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    init_logging(verbose, None);
    let path = resolve_config_path(config_path)?;
    let config = load_config(&path)?;

    println!("Relay Agent Status");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Config:        {}", path.display());
    println!("Endpoint:      {}", config.server.endpoint);
    println!("User:          {}", config.server.user_id);
    println!("Community:     {}", config.server.community_id);
    println!("Poll interval: {} seconds", config.server.poll_interval);

    let store = agent::open_store(&config)?;

    match AgentState::load(&store)? {
        Some(state) => {
            println!();
            println!("Machine ID:    {}", state.machine_id);
            if let Some(last) = state.last_successful_poll {
                let ago = chrono::Utc::now() - last;
                println!(
                    "Last poll:     {} ({} ago)",
                    last.format("%Y-%m-%d %H:%M:%S %Z"),
                    format_duration(ago)
                );
            }
            if let Some(attempt) = state.last_poll_attempt
                && Some(attempt) != state.last_successful_poll
            {
                println!("Last attempt:  {} (failed)", attempt.format("%Y-%m-%d %H:%M:%S %Z"));
            }
            println!("Polls:         {}", state.poll_count);
            println!("Actions:       {}", state.actions_processed);
        }
        None => {
            println!();
            println!("The agent has not polled yet.");
        }
    }

    let auth = Authenticator::new(store.clone(), config.auth_settings())?;
    let runtime = tokio::runtime::Runtime::new()?;
    let stats = runtime.block_on(auth.get_stats())?;

    println!();
    println!("Authentication: {:?}", stats.state);
    println!("  Credentials:      {}", stats.credentials);
    println!("  Active sessions:  {}", stats.active_sessions);
    println!("  Open challenges:  {}", stats.pending_challenges);
    if let Some(expires_at) = stats.current_session_expires_at {
        println!("  Session expires:  {}", expires_at.format("%Y-%m-%d %H:%M:%S %Z"));
    }

    let store_stats = store.stats()?;
    println!();
    println!("Store: {}", store_stats.path.display());
    println!("  Size on disk: {}", format_bytes(store_stats.size_on_disk));
    for (bucket, keys) in &store_stats.buckets {
        println!("  {:<12} {} keys", bucket, keys);
    }

    store.close()?;
    Ok(())
}

/// List module descriptors recorded by previous runs
pub fn modules(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    init_logging(verbose, None);
    let config = load_config(&resolve_config_path(config_path)?)?;
    let store = agent::open_store(&config)?;

    let descriptors = persisted_descriptors(&store)?;
    if descriptors.is_empty() {
        println!("No modules recorded yet. Start the agent once to load them.");
        return Ok(());
    }

    for descriptor in descriptors {
        let state = if descriptor.enabled { "enabled" } else { "disabled" };
        println!("{} {} ({})", descriptor.name, descriptor.version, state);
        println!("  {}", descriptor.description);
        for action in &descriptor.actions {
            println!(
                "    {:<10} {} [timeout {}s]",
                action.name, action.description, action.default_timeout
            );
        }
    }

    store.close()?;
    Ok(())
}

/// Copy the agent store to `target`
pub fn backup(config_path: Option<&Path>, target: PathBuf, verbose: bool) -> Result<()> {
    init_logging(verbose, None);
    let config = load_config(&resolve_config_path(config_path)?)?;
    let store = agent::open_store(&config)?;

    let written = store
        .backup(&target)
        .with_context(|| format!("Failed to back up store to {}", target.display()))?;
    println!("✓ Store backed up to: {}", written.display());

    store.close()?;
    Ok(())
}

/// Remove expired sessions and challenges
pub fn cleanup(config_path: Option<&Path>, forget_modules: bool, verbose: bool) -> Result<()> {
    init_logging(verbose, None);
    let config = load_config(&resolve_config_path(config_path)?)?;
    let store = agent::open_store(&config)?;
    let auth = Authenticator::new(store.clone(), config.auth_settings())?;

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(auth.cleanup())?;

    println!("✓ Removed {} expired session(s)", report.sessions_removed);
    println!("✓ Removed {} expired challenge(s)", report.challenges_removed);

    if forget_modules {
        store.clear_bucket(BUCKET_MODULES)?;
        println!("✓ Forgot persisted module state");
    }

    store.close()?;
    Ok(())
}
