use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{MIN_POLL_INTERVAL, PollerSettings};
use crate::auth::{AuthSettings, check_user_id};

/// Agent configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub server: ServerConfig,

    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub actions: ActionsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub webauthn: WebAuthnConfig,
}

/// Control plane settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Base URL of the control plane
    pub endpoint: String,

    pub community_id: String,

    pub user_id: String,

    /// How often to poll for actions (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

/// Local HTTP listener for the ceremony pages
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,

    #[serde(default = "default_web_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Per-module TOML files used to seed module configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionsConfig {
    /// Used when an action arrives without a timeout (seconds)
    #[serde(default = "default_action_timeout")]
    pub default_timeout: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Relying party settings for credential ceremonies
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebAuthnConfig {
    #[serde(default = "default_rp_id")]
    pub rp_id: String,

    #[serde(default = "default_rp_name")]
    pub rp_name: String,

    #[serde(default = "default_origin")]
    pub origin: String,

    /// Challenge lifetime (seconds)
    #[serde(default = "default_challenge_timeout")]
    pub timeout: u64,

    /// Session lifetime (seconds)
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
}

// Default values
fn default_poll_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    300 // 5 minutes
}

fn default_web_host() -> String {
    "127.0.0.1".to_string()
}

fn default_web_port() -> u16 {
    8765
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "relay-agent")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".relay-agent"))
}

fn default_action_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rp_id() -> String {
    "localhost".to_string()
}

fn default_rp_name() -> String {
    "Relay Agent".to_string()
}

fn default_origin() -> String {
    "http://localhost:8765".to_string()
}

fn default_challenge_timeout() -> u64 {
    60
}

fn default_session_ttl() -> u64 {
    86400 // 24 hours
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            module_dir: None,
        }
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_action_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for WebAuthnConfig {
    fn default() -> Self {
        Self {
            rp_id: default_rp_id(),
            rp_name: default_rp_name(),
            origin: default_origin(),
            timeout: default_challenge_timeout(),
            session_ttl: default_session_ttl(),
        }
    }
}

/// Whether `url` points at this machine
pub fn is_loopback(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

impl AgentConfig {
    /// A configuration with defaults for everything but the control plane identity
    pub fn new(endpoint: &str, user_id: &str, community_id: &str) -> Self {
        Self {
            server: ServerConfig {
                endpoint: endpoint.to_string(),
                community_id: community_id.to_string(),
                user_id: user_id.to_string(),
                poll_interval: default_poll_interval(),
                heartbeat_interval: default_heartbeat_interval(),
            },
            web: WebConfig::default(),
            storage: StorageConfig::default(),
            actions: ActionsConfig::default(),
            logging: LoggingConfig::default(),
            webauthn: WebAuthnConfig::default(),
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self).context("Failed to serialize config")?;

        crate::platform::atomic_write(path, toml.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        // Set restrictive permissions
        crate::platform::set_file_permissions(path, 0o600)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.server.endpoint).context("Invalid control plane endpoint")?;

        // Plain HTTP is only acceptable to a local control plane
        match url.scheme() {
            "https" => {}
            "http" if is_loopback(&url) => {}
            scheme => anyhow::bail!("Endpoint must use HTTPS (got: {})", scheme),
        }

        if let Err(reason) = check_user_id(&self.server.user_id) {
            anyhow::bail!("Invalid server.user_id: {}", reason);
        }
        if self.server.community_id.trim().is_empty() {
            anyhow::bail!("server.community_id must not be empty");
        }

        if self.server.poll_interval < MIN_POLL_INTERVAL.as_secs() {
            anyhow::bail!(
                "Poll interval must be at least {} seconds (got: {})",
                MIN_POLL_INTERVAL.as_secs(),
                self.server.poll_interval
            );
        }
        if self.server.heartbeat_interval == 0 {
            anyhow::bail!("Heartbeat interval must be greater than zero");
        }

        if self.actions.default_timeout == 0 {
            anyhow::bail!("actions.default_timeout must be greater than zero");
        }
        if self.actions.max_concurrent == 0 {
            anyhow::bail!("actions.max_concurrent must be at least 1");
        }

        url::Url::parse(&self.webauthn.origin).context("Invalid webauthn origin")?;
        if self.webauthn.rp_id.is_empty() {
            anyhow::bail!("webauthn.rp_id must not be empty");
        }
        if self.webauthn.timeout == 0 || self.webauthn.session_ttl == 0 {
            anyhow::bail!("webauthn timeout and session_ttl must be greater than zero");
        }

        Ok(())
    }

    /// Path of the agent database
    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join("agent.db")
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            user_id: self.server.user_id.clone(),
            community_id: self.server.community_id.clone(),
            rp_id: self.webauthn.rp_id.clone(),
            rp_name: self.webauthn.rp_name.clone(),
            origin: self.webauthn.origin.clone(),
            challenge_ttl: Duration::from_secs(self.webauthn.timeout),
            session_ttl: Duration::from_secs(self.webauthn.session_ttl),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            poll_interval: Duration::from_secs(self.server.poll_interval),
            default_timeout: Duration::from_secs(self.actions.default_timeout),
            max_concurrent: self.actions.max_concurrent,
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_interval),
            ..PollerSettings::default()
        }
    }
}

/// Default config file location
pub fn get_config_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "relay-agent")
        .context("Could not determine a configuration directory for this platform")?;
    Ok(dirs.config_dir().join("agent.toml"))
}
