use std::collections::HashMap;
use std::sync::Arc;

use strand_core::error::{Result, StrandError};
use strand_core::traits::NodeExecutor;

use crate::builtin;

/// Construction-time switches for the built-in catalogue.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinOptions {
    /// When false, `spawn_run`/`spawn_group`/`join` stay registered but
    /// refuse at validation and execution time.
    pub orchestration_enabled: bool,
}

impl Default for BuiltinOptions {
    fn default() -> Self {
        Self {
            orchestration_enabled: true,
        }
    }
}

/// Registry of node executors, keyed by node type.
///
/// Built once at startup and shared by the compiler and runtime.
pub struct NodeRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for the same type.
    pub fn register(&mut self, executor: impl NodeExecutor) {
        let node_type = executor.node_type().to_string();
        self.executors.insert(node_type, Arc::new(executor));
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Like `get`, but an unknown type is a resolution error.
    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>> {
        self.get(node_type)
            .ok_or_else(|| StrandError::Resolution(format!("unknown node type '{}'", node_type)))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Create a registry with all built-in node types registered.
    pub fn with_builtins(options: BuiltinOptions) -> Self {
        let mut registry = Self::new();

        // ── Control flow ────────────────────────────────────────
        registry.register(builtin::control::StartNode);
        registry.register(builtin::control::EndNode);
        registry.register(builtin::control::NoteNode);
        registry.register(builtin::control::IfElseNode);
        registry.register(builtin::control::WhileNode);
        registry.register(builtin::control::ParallelNode);
        registry.register(builtin::control::ApprovalNode);
        registry.register(builtin::classify::ClassifyNode);

        // ── Data ────────────────────────────────────────────────
        registry.register(builtin::data::TransformNode);
        registry.register(builtin::data::SetStateNode);

        // ── Capabilities ────────────────────────────────────────
        registry.register(builtin::capability::LlmNode);
        registry.register(builtin::capability::AgentNode);
        registry.register(builtin::capability::ToolNode);
        registry.register(builtin::capability::RetrievalNode);

        // ── Orchestration ───────────────────────────────────────
        let enabled = options.orchestration_enabled;
        registry.register(builtin::orchestration::SpawnRunNode::new(enabled));
        registry.register(builtin::orchestration::SpawnGroupNode::new(enabled));
        registry.register(builtin::orchestration::JoinNode::new(enabled));

        registry
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
