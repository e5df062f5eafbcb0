use chrono::Utc;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::modules::{ActionSpec, Module, ModuleInfo, Params, ParamSpec};

/// Host identity and liveness
pub struct SystemModule {
    started: Instant,
}

impl SystemModule {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn host_info(&self) -> Params {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok();
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut info = Params::new();
        info.insert("agent_version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        info.insert("os".to_string(), json!(std::env::consts::OS));
        info.insert("arch".to_string(), json!(std::env::consts::ARCH));
        info.insert("family".to_string(), json!(std::env::consts::FAMILY));
        info.insert("cpus".to_string(), json!(cpus));
        info.insert("hostname".to_string(), json!(hostname));
        info.insert("uptime_secs".to_string(), json!(self.started.elapsed().as_secs()));
        info
    }
}

impl Default for SystemModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Module for SystemModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: "system".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Host information and liveness checks".to_string(),
            author: "relay-agent".to_string(),
        }
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![
            ActionSpec::new("info", "Report host and agent details", vec![], 10),
            ActionSpec::new(
                "ping",
                "Answer with a timestamp, echoing any parameters",
                vec![ParamSpec::optional("message", "string")],
                5,
            ),
        ]
    }

    async fn execute_action(&self, _deadline: Instant, action: &str, params: Params) -> anyhow::Result<Params> {
        match action {
            "info" => Ok(self.host_info()),
            "ping" => {
                let mut pong = Params::new();
                pong.insert("pong".to_string(), Value::Bool(true));
                pong.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
                pong.insert("echo".to_string(), Value::Object(params));
                Ok(pong)
            }
            other => anyhow::bail!("Unsupported action: {other}"),
        }
    }
}
