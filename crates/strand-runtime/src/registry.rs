use std::collections::HashMap;
use std::sync::Arc;

use strand_core::error::{Result, StrandError};
use strand_nodes::NodeRegistry;

use crate::adapter::RuntimeAdapter;
use crate::local::LocalRuntime;

/// Named runtime backends, one of which is the default.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn RuntimeAdapter>>,
    default: String,
}

impl AdapterRegistry {
    pub fn new(default: Arc<dyn RuntimeAdapter>) -> Self {
        let name = default.name().to_string();
        let mut adapters = HashMap::new();
        adapters.insert(name.clone(), default);
        Self {
            adapters,
            default: name,
        }
    }

    /// A registry whose default is the in-process runtime.
    pub fn with_local(nodes: Arc<NodeRegistry>) -> Self {
        Self::new(Arc::new(LocalRuntime::new(nodes)))
    }

    /// Register a backend, replacing any previous one with the same name.
    pub fn register(&mut self, adapter: Arc<dyn RuntimeAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Switch the default backend. The name must already be registered.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.adapters.contains_key(name) {
            return Err(StrandError::Resolution(format!(
                "runtime backend '{}' is not registered",
                name
            )));
        }
        self.default = name.to_string();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RuntimeAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn RuntimeAdapter>> {
        self.get(name).ok_or_else(|| {
            StrandError::Resolution(format!("runtime backend '{}' is not registered", name))
        })
    }

    pub fn default_adapter(&self) -> Arc<dyn RuntimeAdapter> {
        // The default name is only ever set to a registered key.
        self.adapters[&self.default].clone()
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
