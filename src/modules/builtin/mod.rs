// Modules compiled into the agent

mod command;
mod kv;
mod system;

pub use command::CommandModule;
pub use kv::KvModule;
pub use system::SystemModule;

use std::sync::Arc;

use super::Module;
use crate::store::Store;

/// Every built-in module, ready to be loaded into a registry
pub fn all(store: &Store) -> Vec<Arc<dyn Module>> {
    vec![
        Arc::new(SystemModule::new()),
        Arc::new(KvModule::new(store.clone())),
        Arc::new(CommandModule::default()),
    ]
}
