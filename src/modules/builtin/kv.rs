use serde_json::{Value, json};
use std::sync::RwLock;
use tokio::time::Instant;

use crate::modules::{ActionSpec, Module, ModuleInfo, Params, ParamSpec, optional_str, required_str};
use crate::store::{BUCKET_DATA, Store};

const DEFAULT_PREFIX: &str = "kv:";

/// Remote access to a namespaced slice of the data bucket
pub struct KvModule {
    store: Store,
    prefix: RwLock<String>,
}

impl KvModule {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            prefix: RwLock::new(DEFAULT_PREFIX.to_string()),
        }
    }

    fn key(&self, key: &str) -> String {
        let prefix = self.prefix.read().unwrap_or_else(|e| e.into_inner());
        format!("{prefix}{key}")
    }

    fn get(&self, params: &Params) -> anyhow::Result<Params> {
        let key = required_str(params, "key")?;
        let value: Option<Value> = self.store.get_json(BUCKET_DATA, &self.key(key))?;

        let mut result = Params::new();
        result.insert("key".to_string(), json!(key));
        result.insert("found".to_string(), json!(value.is_some()));
        result.insert("value".to_string(), value.unwrap_or(Value::Null));
        Ok(result)
    }

    fn set(&self, params: &Params) -> anyhow::Result<Params> {
        let key = required_str(params, "key")?;
        let value = params
            .get("value")
            .ok_or_else(|| anyhow::anyhow!("Missing parameter: value"))?;
        self.store.set_json(BUCKET_DATA, &self.key(key), value)?;

        let mut result = Params::new();
        result.insert("key".to_string(), json!(key));
        result.insert("stored".to_string(), json!(true));
        Ok(result)
    }

    fn delete(&self, params: &Params) -> anyhow::Result<Params> {
        let key = required_str(params, "key")?;
        let full = self.key(key);
        let existed = self.store.exists(BUCKET_DATA, &full)?;
        self.store.delete(BUCKET_DATA, &full)?;

        let mut result = Params::new();
        result.insert("key".to_string(), json!(key));
        result.insert("deleted".to_string(), json!(existed));
        Ok(result)
    }

    fn list(&self, params: &Params) -> anyhow::Result<Params> {
        let namespace = self.key("");
        let search = self.key(optional_str(params, "prefix")?.unwrap_or(""));
        let keys: Vec<String> = self
            .store
            .list(BUCKET_DATA, &search)?
            .into_iter()
            .map(|k| k[namespace.len()..].to_string())
            .collect();

        let mut result = Params::new();
        result.insert("count".to_string(), json!(keys.len()));
        result.insert("keys".to_string(), json!(keys));
        Ok(result)
    }
}

#[async_trait::async_trait]
impl Module for KvModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo {
            name: "kv".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Read and write JSON values in the agent data store".to_string(),
            author: "relay-agent".to_string(),
        }
    }

    fn actions(&self) -> Vec<ActionSpec> {
        vec![
            ActionSpec::new("get", "Read a value", vec![ParamSpec::required("key", "string")], 5),
            ActionSpec::new(
                "set",
                "Write a value",
                vec![ParamSpec::required("key", "string"), ParamSpec::required("value", "any")],
                5,
            ),
            ActionSpec::new("delete", "Remove a value", vec![ParamSpec::required("key", "string")], 5),
            ActionSpec::new("list", "List keys", vec![ParamSpec::optional("prefix", "string")], 5),
        ]
    }

    async fn initialize(&self, config: &Value) -> anyhow::Result<()> {
        if let Some(prefix) = config.get("prefix") {
            let prefix = prefix
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("kv prefix must be a string"))?;
            *self.prefix.write().unwrap_or_else(|e| e.into_inner()) = prefix.to_string();
        }
        Ok(())
    }

    async fn execute_action(&self, _deadline: Instant, action: &str, params: Params) -> anyhow::Result<Params> {
        match action {
            "get" => self.get(&params),
            "set" => self.set(&params),
            "delete" => self.delete(&params),
            "list" => self.list(&params),
            other => anyhow::bail!("Unsupported action: {other}"),
        }
    }
}
