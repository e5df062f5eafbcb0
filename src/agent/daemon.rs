use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

use super::{Poller, RemoteClient};
use crate::auth::Authenticator;
use crate::config::AgentConfig;
use crate::modules::{Module, ModuleRegistry, builtin};
use crate::platform;
use crate::store::Store;
use crate::web::{self, WebState};

/// Open the agent store under the configured data directory
pub fn open_store(config: &AgentConfig) -> Result<Store> {
    platform::ensure_directory_exists(&config.storage.data_dir)?;

    let path = config.database_path();
    Store::open(&path).with_context(|| {
        format!(
            "Failed to open agent store at {} (is the agent already running?)",
            path.display()
        )
    })
}

/// Run the agent until Ctrl-C
pub async fn run_agent_daemon(config: AgentConfig) -> Result<()> {
    tracing::info!("Starting agent daemon");
    tracing::info!("Control plane: {}", config.server.endpoint);
    tracing::info!(
        "Poll interval: {} seconds, default action timeout: {} seconds",
        config.server.poll_interval,
        config.actions.default_timeout
    );

    let store = open_store(&config)?;
    let auth = Arc::new(
        Authenticator::new(store.clone(), config.auth_settings())
            .context("Failed to initialize authenticator")?,
    );
    if let Err(e) = auth.cleanup().await {
        tracing::warn!("Failed to purge expired authentication state: {}", e);
    }

    let registry = Arc::new(ModuleRegistry::new(
        store.clone(),
        config.storage.module_dir.clone(),
    ));
    for module in builtin::all(&store) {
        let name = module.info().name;
        if let Err(e) = registry.load_module(module).await {
            tracing::error!(module = %name, "Failed to load module: {}", e);
        }
    }

    let client = Arc::new(RemoteClient::new(&config.server.endpoint)?);
    let poller = Arc::new(Poller::new(
        client,
        auth.clone(),
        registry.clone(),
        store.clone(),
        config.poller_settings(),
    )?);

    if auth.get_current_session().await.is_err() {
        tracing::info!(
            "No active session. Register or log in at http://{}:{}/ to start polling.",
            config.web.host,
            config.web.port
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut web_task = tokio::spawn(web::serve(
        config.web.host.clone(),
        config.web.port,
        WebState {
            allowed_origin: config.webauthn.origin.clone(),
            auth: auth.clone(),
            registry: registry.clone(),
            poller: poller.clone(),
        },
        shutdown_rx.clone(),
    ));

    let mut poller_task = {
        let poller = poller.clone();
        tokio::spawn(async move { poller.run(shutdown_rx).await })
    };

    let (finished_web, finished_poller) = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
            (None, None)
        }
        joined = &mut web_task => (Some(joined), None),
        joined = &mut poller_task => {
            tracing::error!("Poll loop stopped before shutdown was requested");
            (None, Some(joined))
        }
    };

    shutdown_tx.send_replace(true);

    let poller_stopped_early = finished_poller.is_some();
    let poller_result = match finished_poller {
        Some(joined) => joined,
        None => poller_task.await,
    };
    if let Err(e) = &poller_result {
        tracing::error!("Poller task failed: {}", e);
    }

    let web_result = match finished_web {
        Some(joined) => joined,
        None => web_task.await,
    };

    registry.cleanup().await;
    store.close().context("Failed to flush agent store")?;
    tracing::info!("Agent stopped");

    match web_result {
        Ok(result) => result?,
        Err(e) => return Err(e).context("Local web server task failed"),
    }
    poller_result.context("Poll loop task failed")?;
    if poller_stopped_early {
        anyhow::bail!("Poll loop stopped unexpectedly");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_store_creates_data_dir() {
        let dir = tempdir().unwrap();
        let mut config = AgentConfig::new("https://control.example.com", "u1", "c1");
        config.storage.data_dir = dir.path().join("data");

        let store = open_store(&config).unwrap();
        assert!(config.database_path().exists());
        store.close().unwrap();
    }
}
