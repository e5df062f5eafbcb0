use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::Instant;

use crate::modules::{ActionSpec, Module, ModuleInfo, Params, ParamSpec, required_str};

fn default_max_output_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Deserialize)]
struct CommandSettings {
    /// Program names that may be run; empty rejects everything
    #[serde(default)]
    allowed_commands: Vec<String>,

    #[serde(default = "default_max_output_bytes")]
    max_output_bytes: usize,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Runs allow-listed programs
#[derive(Default)]
pub struct CommandModule {
    settings: RwLock<CommandSettings>,
}

/// Keep the first `limit` bytes of a pipe and discard the rest
///
/// The pipe is drained to the end so the child never blocks on a full buffer.
async fn read_bounded<R: AsyncRead + Unpin>(mut pipe: R, limit: usize) -> std::io::Result<(String, bool)> {
    let mut kept = Vec::new();
    (&mut pipe).take(limit as u64).read_to_end(&mut kept).await?;
    let discarded = tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok((String::from_utf8_lossy(&kept).into_owned(), discarded > 0))
}

impl CommandModule {
    fn settings(&self) -> CommandSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn run(&self, deadline: Instant, params: &Params) -> anyhow::Result<Params> {
        let settings = self.settings();
        let program = required_str(params, "command")?;
        if !settings.allowed_commands.iter().any(|c| c == program) {
            anyhow::bail!("Command not allowed: {program}");
        }

        let args: Vec<String> = match params.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone()).context("args must be an array of strings")?,
        };

        tracing::info!(command = program, args = ?args, "Running command");

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {program}"))?;

        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;
        let limit = settings.max_output_bytes;

        // On the deadline path `child` is dropped on return, which kills it.
        let ((stdout, stdout_truncated), (stderr, stderr_truncated), status) = tokio::time::timeout_at(
            deadline,
            async {
                tokio::try_join!(
                    read_bounded(stdout, limit),
                    read_bounded(stderr, limit),
                    child.wait()
                )
            },
        )
        .await
        .map_err(|_| anyhow::anyhow!("{program} did not finish before the deadline"))?
        .with_context(|| format!("Failed to wait for {program}"))?;

        let mut result = Params::new();
        result.insert("exit_code".to_string(), json!(status.code()));
        result.insert("success".to_string(), json!(status.success()));
        result.insert("stdout".to_string(), json!(stdout));
        result.insert("stderr".to_string(), json!(stderr));
        result.insert(
            "truncated".to_string(),
            json!(stdout_truncated || stderr_truncated),
        );
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Module for CommandModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: "command".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Run allow-listed programs on the host".to_string(),
            author: "relay-agent".to_string(),
        }
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![ActionSpec::new(
            "run",
            "Run a program and capture its output",
            vec![ParamSpec::required("command", "string"), ParamSpec::optional("args", "array")],
            30,
        )]
    }

    async fn initialize(&self, config: &Value) -> anyhow::Result<()> {
        let settings: CommandSettings =
            serde_json::from_value(config.clone()).context("Invalid command module configuration")?;
        tracing::debug!(allowed = settings.allowed_commands.len(), "Command module configured");
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    async fn execute_action(&self, deadline: Instant, action: &str, params: Params) -> anyhow::Result<Params> {
        match action {
            "run" => self.run(deadline, &params).await,
            other => anyhow::bail!("Unsupported action: {other}"),
        }
    }
}
