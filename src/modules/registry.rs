use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use super::{Module, ModuleDescriptor, Params};
use crate::error::{AgentError, Result};
use crate::store::{BUCKET_CONFIG, BUCKET_MODULES, Store};

struct LoadedModule {
    module: Arc<dyn Module>,
    descriptor: ModuleDescriptor,
}

/// Registry counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub loaded: usize,
    pub enabled: usize,
    pub executions: u64,
    pub failures: u64,
    pub timeouts: u64,
}

#[derive(Default)]
struct Counters {
    executions: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Hosts modules and routes action execution to them
///
/// `modules` is only write-locked for the short structural update itself;
/// `admin` serializes load/unload/enable/disable across their awaits. Module
/// calls run with no lock held.
pub struct ModuleRegistry {
    store: Store,
    module_dir: Option<PathBuf>,
    modules: RwLock<HashMap<String, LoadedModule>>,
    admin: Mutex<()>,
    counters: Counters,
}

fn config_key(name: &str) -> String {
    format!("module:{name}")
}

/// Module call running on its own task; aborted when dropped
struct ModuleCall(JoinHandle<anyhow::Result<Params>>);

impl Drop for ModuleCall {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_reason(error: JoinError) -> String {
    if !error.is_panic() {
        return "module task was cancelled".to_string();
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("module panicked: {message}")
}

impl ModuleRegistry {
    pub fn new(store: Store, module_dir: Option<PathBuf>) -> Self {
        Self {
            store,
            module_dir,
            modules: RwLock::new(HashMap::new()),
            admin: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Initialize `module` with its stored configuration and register it
    pub async fn load_module(&self, module: Arc<dyn Module>) -> Result<ModuleDescriptor> {
        let _admin = self.admin.lock().await;
        let info = module.info();
        let name = info.name.clone();

        if self.modules.read().await.contains_key(&name) {
            return Err(AgentError::ModuleAlreadyLoaded(name));
        }

        let config = self.module_config(&name)?;
        module
            .initialize(&config)
            .await
            .map_err(|e| AgentError::ModuleInitialization {
                module: name.clone(),
                reason: format!("{e:#}"),
            })?;

        let enabled = self
            .store
            .get_json::<ModuleDescriptor>(BUCKET_MODULES, &name)?
            .map(|previous| previous.enabled)
            .unwrap_or(true);

        let descriptor = ModuleDescriptor::new(info, module.actions(), enabled);
        self.store.set_json(BUCKET_MODULES, &name, &descriptor)?;

        self.modules.write().await.insert(
            name.clone(),
            LoadedModule {
                module,
                descriptor: descriptor.clone(),
            },
        );

        tracing::info!(
            module = %name,
            version = %descriptor.version,
            actions = descriptor.actions.len(),
            enabled,
            "Module loaded"
        );
        Ok(descriptor)
    }

    /// Run `action` on `module_name`, giving up at `deadline`
    pub async fn execute_action(
        &self,
        deadline: Instant,
        module_name: &str,
        action: &str,
        params: Params,
    ) -> Result<Params> {
        let module = {
            let modules = self.modules.read().await;
            let loaded = modules
                .get(module_name)
                .ok_or_else(|| AgentError::ModuleNotFound(module_name.to_string()))?;

            if !loaded.descriptor.enabled {
                return Err(AgentError::ModuleDisabled(module_name.to_string()));
            }
            if !loaded.descriptor.has_action(action) {
                return Err(AgentError::ActionNotFound {
                    module: module_name.to_string(),
                    action: action.to_string(),
                });
            }
            loaded.module.clone()
        };

        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        tracing::debug!(module = module_name, action, "Executing action");

        let mut call = ModuleCall(tokio::spawn({
            let action = action.to_string();
            async move { module.execute_action(deadline, &action, params).await }
        }));

        match tokio::time::timeout_at(deadline, &mut call.0).await {
            Ok(Ok(Ok(result))) => {
                tracing::debug!(
                    module = module_name,
                    action,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Action completed"
                );
                Ok(result)
            }
            Ok(Ok(Err(e))) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(AgentError::ActionFailed {
                    module: module_name.to_string(),
                    action: action.to_string(),
                    reason: format!("{e:#}"),
                })
            }
            Ok(Err(join_error)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                let reason = panic_reason(join_error);
                tracing::error!(module = module_name, action, "{}", reason);
                Err(AgentError::ActionFailed {
                    module: module_name.to_string(),
                    action: action.to_string(),
                    reason,
                })
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let after = deadline.saturating_duration_since(started);
                tracing::warn!(
                    module = module_name,
                    action,
                    timeout_ms = after.as_millis() as u64,
                    "Action abandoned at deadline"
                );
                Err(AgentError::Timeout {
                    module: module_name.to_string(),
                    action: action.to_string(),
                    after,
                })
            }
        }
    }

    pub async fn enable_module(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true).await
    }

    pub async fn disable_module(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let _admin = self.admin.lock().await;
        let mut modules = self.modules.write().await;
        let loaded = modules
            .get_mut(name)
            .ok_or_else(|| AgentError::ModuleNotFound(name.to_string()))?;

        loaded.descriptor.enabled = enabled;
        self.store.set_json(BUCKET_MODULES, name, &loaded.descriptor)?;

        tracing::info!(module = name, enabled, "Module enablement changed");
        Ok(())
    }

    /// Remove a module; its stored configuration and descriptor are kept
    pub async fn unload_module(&self, name: &str) -> Result<()> {
        let _admin = self.admin.lock().await;
        let loaded = self
            .modules
            .write()
            .await
            .remove(name)
            .ok_or_else(|| AgentError::ModuleNotFound(name.to_string()))?;

        if let Err(e) = loaded.module.cleanup().await {
            tracing::warn!(module = name, "Module cleanup failed: {:#}", e);
        }

        tracing::info!(module = name, "Module unloaded");
        Ok(())
    }

    pub async fn get_module_infos(&self) -> Vec<ModuleDescriptor> {
        let modules = self.modules.read().await;
        let mut infos: Vec<_> = modules.values().map(|m| m.descriptor.clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn get_module_info(&self, name: &str) -> Result<ModuleDescriptor> {
        self.modules
            .read()
            .await
            .get(name)
            .map(|m| m.descriptor.clone())
            .ok_or_else(|| AgentError::ModuleNotFound(name.to_string()))
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let modules = self.modules.read().await;
        RegistryStats {
            loaded: modules.len(),
            enabled: modules.values().filter(|m| m.descriptor.enabled).count(),
            executions: self.counters.executions.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Clean up every module and empty the registry
    pub async fn cleanup(&self) {
        let _admin = self.admin.lock().await;
        let drained: Vec<(String, LoadedModule)> = self.modules.write().await.drain().collect();

        for (name, loaded) in drained {
            if let Err(e) = loaded.module.cleanup().await {
                tracing::warn!(module = %name, "Module cleanup failed: {:#}", e);
            }
        }
        tracing::info!("Module registry cleaned up");
    }

    /// Stored configuration for `name`, seeded from `<module_dir>/<name>.toml` on first load
    fn module_config(&self, name: &str) -> Result<Value> {
        if let Some(config) = self.store.get_json::<Value>(BUCKET_CONFIG, &config_key(name))? {
            return Ok(config);
        }

        let Some(dir) = &self.module_dir else {
            return Ok(Value::Object(Params::new()));
        };

        match read_config_file(dir, name) {
            Ok(Some(config)) => {
                self.store.set_json(BUCKET_CONFIG, &config_key(name), &config)?;
                tracing::info!(module = name, "Module configuration imported from {}", dir.display());
                Ok(config)
            }
            Ok(None) => Ok(Value::Object(Params::new())),
            Err(e) => Err(AgentError::ModuleInitialization {
                module: name.to_string(),
                reason: format!("{e:#}"),
            }),
        }
    }
}

fn read_config_file(dir: &Path, name: &str) -> anyhow::Result<Option<Value>> {
    use anyhow::Context;

    let path = dir.join(format!("{name}.toml"));
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read module config: {}", path.display()))?;
    let config: Value = toml::from_str(&content)
        .with_context(|| format!("Failed to parse module config: {}", path.display()))?;
    Ok(Some(config))
}

/// Descriptor snapshots persisted by previous runs
pub fn persisted_descriptors(store: &Store) -> Result<Vec<ModuleDescriptor>> {
    store
        .get_all(BUCKET_MODULES)?
        .values()
        .map(|bytes| serde_json::from_slice::<ModuleDescriptor>(bytes).map_err(AgentError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{ActionSpec, ModuleInfo, ParamSpec};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Echoes its input after an optional delay and counts invocations
    #[derive(Default)]
    struct EchoModule {
        calls: AtomicUsize,
        initialized_with: std::sync::Mutex<Option<Value>>,
        cleaned_up: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Module for EchoModule {
        fn info(&self) -> ModuleInfo {
            ModuleInfo {
                name: "echo".to_string(),
                version: "0.1.0".to_string(),
                description: "Test echo module".to_string(),
                author: "tests".to_string(),
            }
        }

        fn actions(&self) -> Vec<ActionSpec> {
            vec![
                ActionSpec::new("echo", "Echo params", vec![ParamSpec::optional("delay_ms", "number")], 5),
                ActionSpec::new("fail", "Always fails", vec![], 5),
                ActionSpec::new("panic", "Panics mid-call", vec![], 5),
            ]
        }

        async fn initialize(&self, config: &Value) -> anyhow::Result<()> {
            *self.initialized_with.lock().unwrap() = Some(config.clone());
            Ok(())
        }

        async fn execute_action(&self, _deadline: Instant, action: &str, params: Params) -> anyhow::Result<Params> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match action {
                "echo" => {
                    if let Some(delay) = params.get("delay_ms").and_then(Value::as_u64) {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Ok(params)
                }
                "panic" => panic!("module bug"),
                _ => anyhow::bail!("echo failure"),
            }
        }

        async fn cleanup(&self) -> anyhow::Result<()> {
            self.cleaned_up.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> (tempfile::TempDir, Store, ModuleRegistry) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("agent.db")).unwrap();
        let registry = ModuleRegistry::new(store.clone(), Some(dir.path().join("modules")));
        (dir, store, registry)
    }

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    fn in_secs(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn executes_loaded_module() {
        let (_dir, _store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();

        let result = registry
            .execute_action(in_secs(5), "echo", "echo", params(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(result.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn panicking_module_fails_the_action_only() {
        let (_dir, _store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();

        let result = registry.execute_action(in_secs(5), "echo", "panic", Params::new()).await;
        match result {
            Err(AgentError::ActionFailed { reason, .. }) => assert!(reason.contains("module bug")),
            other => panic!("unexpected result: {other:?}"),
        }

        let echoed = registry
            .execute_action(in_secs(5), "echo", "echo", params(json!({"after": true})))
            .await
            .unwrap();
        assert_eq!(echoed.get("after"), Some(&json!(true)));
        assert_eq!(registry.get_stats().await.failures, 1);
    }

    #[tokio::test]
    async fn unknown_module_is_not_found() {
        let (_dir, _store, registry) = registry();
        let result = registry.execute_action(in_secs(5), "ghost", "echo", Params::new()).await;
        assert!(matches!(result, Err(AgentError::ModuleNotFound(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let (_dir, _store, registry) = registry();
        let module = Arc::new(EchoModule::default());
        registry.load_module(module.clone()).await.unwrap();

        let result = registry.execute_action(in_secs(5), "echo", "dance", Params::new()).await;
        assert!(matches!(result, Err(AgentError::ActionNotFound { .. })));
        assert_eq!(module.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_module_is_never_invoked() {
        let (_dir, _store, registry) = registry();
        let module = Arc::new(EchoModule::default());
        registry.load_module(module.clone()).await.unwrap();
        registry.disable_module("echo").await.unwrap();

        for _ in 0..3 {
            let result = registry.execute_action(in_secs(5), "echo", "echo", Params::new()).await;
            assert!(matches!(result, Err(AgentError::ModuleDisabled(_))));
        }
        assert_eq!(module.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.get_stats().await.executions, 0);

        registry.enable_module("echo").await.unwrap();
        assert!(registry.execute_action(in_secs(5), "echo", "echo", Params::new()).await.is_ok());
        assert_eq!(module.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_action_times_out_near_deadline() {
        let (_dir, _store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();

        let started = std::time::Instant::now();
        let deadline = Instant::now() + Duration::from_millis(200);
        let result = registry
            .execute_action(deadline, "echo", "echo", params(json!({"delay_ms": 2000})))
            .await;

        assert!(matches!(result, Err(AgentError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(registry.get_stats().await.timeouts, 1);
    }

    #[tokio::test]
    async fn module_errors_carry_context() {
        let (_dir, _store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();

        let err = registry
            .execute_action(in_secs(5), "echo", "fail", Params::new())
            .await
            .unwrap_err();
        match err {
            AgentError::ActionFailed { module, action, reason } => {
                assert_eq!(module, "echo");
                assert_eq!(action, "fail");
                assert!(reason.contains("echo failure"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.get_stats().await.failures, 1);
    }

    #[tokio::test]
    async fn concurrent_calls_do_not_mix_results() {
        let (_dir, _store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let input = params(json!({"call": i, "delay_ms": (8 - i) * 10}));
                let output = registry
                    .execute_action(in_secs(5), "echo", "echo", input)
                    .await
                    .unwrap();
                (i, output)
            }));
        }

        for handle in handles {
            let (i, output) = handle.await.unwrap();
            assert_eq!(output.get("call"), Some(&json!(i)));
        }
    }

    #[tokio::test]
    async fn slow_action_does_not_block_administration() {
        let (_dir, _store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();
        let registry = Arc::new(registry);

        let running = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .execute_action(in_secs(5), "echo", "echo", params(json!({"delay_ms": 300})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        registry.disable_module("echo").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        // The in-flight call still completes.
        assert!(running.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn duplicate_load_is_rejected() {
        let (_dir, _store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();
        let again = registry.load_module(Arc::new(EchoModule::default())).await;
        assert!(matches!(again, Err(AgentError::ModuleAlreadyLoaded(_))));
    }

    #[tokio::test]
    async fn enabled_flag_survives_unload_and_reload() {
        let (_dir, store, registry) = registry();
        registry.load_module(Arc::new(EchoModule::default())).await.unwrap();
        registry.disable_module("echo").await.unwrap();

        let module = Arc::new(EchoModule::default());
        registry.unload_module("echo").await.unwrap();
        assert!(matches!(registry.get_module_info("echo").await, Err(AgentError::ModuleNotFound(_))));
        assert_eq!(persisted_descriptors(&store).unwrap().len(), 1);

        let descriptor = registry.load_module(module).await.unwrap();
        assert!(!descriptor.enabled);
    }

    #[tokio::test]
    async fn config_is_seeded_from_module_dir() {
        let (dir, store, registry) = registry();
        let module_dir = dir.path().join("modules");
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join("module.toml"), "greeting = \"hi\"\nlimit = 3\n").unwrap();

        let module = Arc::new(EchoModule::default());
        registry.load_module(module.clone()).await.unwrap();

        let seen = module.initialized_with.lock().unwrap().clone().unwrap();
        assert_eq!(seen, json!({"greeting": "hi", "limit": 3}));

        let stored: Option<Value> = store.get_json(BUCKET_CONFIG, "module:module").unwrap();
        assert_eq!(stored, Some(seen));
    }

    #[tokio::test]
    async fn cleanup_runs_module_cleanup_and_empties_registry() {
        let (_dir, _store, registry) = registry();
        let module = Arc::new(EchoModule::default());
        registry.load_module(module.clone()).await.unwrap();

        registry.cleanup().await;

        assert!(module.cleaned_up.load(Ordering::SeqCst));
        assert!(registry.get_module_infos().await.is_empty());
        assert_eq!(registry.get_stats().await.loaded, 0);
    }
}
