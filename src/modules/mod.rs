// Local capability providers
//
// A module is a named provider exposing a fixed set of actions. Modules are
// compiled into the agent and registered with the `ModuleRegistry`, which
// owns enablement, persistence of descriptors and deadline enforcement.

pub mod builtin;
mod registry;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

pub use registry::{ModuleRegistry, RegistryStats, persisted_descriptors};

/// Parameters passed to, and results returned from, an action
pub type Params = serde_json::Map<String, Value>;

/// Static identity of a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// JSON type name: string, number, boolean, array, object
    pub kind: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(name: &str, kind: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }
}

/// One invocable action and its parameter shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParamSpec>,
    /// Seconds
    pub default_timeout: u64,
}

impl ActionSpec {
    pub fn new(name: &str, description: &str, parameters: Vec<ParamSpec>, default_timeout: u64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            default_timeout,
        }
    }
}

/// Registry view of a loaded module; a snapshot is persisted per module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub actions: Vec<ActionSpec>,
    pub enabled: bool,
    pub loaded_at: DateTime<Utc>,
}

impl ModuleDescriptor {
    pub fn new(info: ModuleInfo, actions: Vec<ActionSpec>, enabled: bool) -> Self {
        Self {
            name: info.name,
            version: info.version,
            description: info.description,
            author: info.author,
            actions,
            enabled,
            loaded_at: Utc::now(),
        }
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.name == action)
    }
}

/// A capability provider
///
/// `execute_action` may be called concurrently. The registry stops waiting at
/// `deadline` and drops the returned future, so implementations must not leave
/// shared state inconsistent if they are cancelled at an await point, and
/// should stop any external work (child processes, connections) by then.
#[async_trait::async_trait]
pub trait Module: Send + Sync {
    fn info(&self) -> ModuleInfo;

    fn actions(&self) -> Vec<ActionSpec>;

    /// Apply the module's stored configuration; called once before first use
    async fn initialize(&self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute_action(&self, deadline: Instant, action: &str, params: Params) -> anyhow::Result<Params>;

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fetch a required string parameter
pub fn required_str<'a>(params: &'a Params, name: &str) -> anyhow::Result<&'a str> {
    params
        .get(name)
        .with_context(|| format!("Missing parameter: {name}"))?
        .as_str()
        .with_context(|| format!("Parameter {name} must be a string"))
}

/// Fetch an optional string parameter
pub fn optional_str<'a>(params: &'a Params, name: &str) -> anyhow::Result<Option<&'a str>> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .with_context(|| format!("Parameter {name} must be a string")),
    }
}
