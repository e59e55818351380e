use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orchestration::*;
use crate::state::GraphState;
use crate::types::{NodeContext, NodeOutput, RunId, ValidationResult};

/// Node executor, one implementation per node type.
///
/// Executors are resolved once when a graph is compiled and are stateless
/// across executions; anything tenant-specific arrives through the context.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Node-type tag (e.g. `"if_else"`).
    fn node_type(&self) -> &str;

    /// Field-level config validation, run by the compiler.
    fn validate_config(&self, config: &serde_json::Value) -> ValidationResult;

    /// Execute against a snapshot of run state.
    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a serde_json::Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>>;

    /// Output handles for branching types; `None` for plain nodes.
    fn output_handles(&self, config: &serde_json::Value) -> Option<Vec<String>> {
        let _ = config;
        None
    }

    /// Handle used when the chosen handle has no routing entry.
    fn default_handle(&self, config: &serde_json::Value) -> Option<String> {
        let _ = config;
        None
    }

    /// Whether this node can start a graph.
    fn is_input(&self) -> bool {
        false
    }

    /// Whether this node produces the graph's result.
    fn is_output(&self) -> bool {
        false
    }

    /// Inert nodes (annotations) are excluded from reachability checks.
    fn is_inert(&self) -> bool {
        false
    }

    /// Orchestration primitives are gated by a feature flag.
    fn is_orchestration(&self) -> bool {
        false
    }
}

/// Orchestration kernel operations available to node executors.
///
/// Lives here so node crates can call the kernel without depending on it.
pub trait Orchestrator: Send + Sync + 'static {
    fn spawn_run(&self, req: SpawnRequest) -> BoxFuture<'_, Result<SpawnOutcome>>;

    fn spawn_group(&self, req: SpawnGroupRequest) -> BoxFuture<'_, Result<SpawnGroupOutcome>>;

    fn join(&self, req: JoinRequest) -> BoxFuture<'_, Result<JoinOutcome>>;

    fn cancel_subtree(
        &self,
        caller_run_id: RunId,
        run_id: RunId,
    ) -> BoxFuture<'_, Result<CancelOutcome>>;

    fn evaluate_and_replan(
        &self,
        caller_run_id: RunId,
        group_id: String,
        max_attempts: u32,
    ) -> BoxFuture<'_, Result<ReplanOutcome>>;
}

/// Workload-identity broker. `mint` is the only call made into it.
pub trait TokenBroker: Send + Sync + 'static {
    fn mint(
        &self,
        grant_id: &str,
        scopes: Vec<String>,
        audience: Option<String>,
    ) -> BoxFuture<'_, Result<String>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub tenant_id: String,
    pub model_id: String,
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    /// Tool ids the model may call (agent nodes).
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    pub tenant_id: String,
    pub tool_id: String,
    pub arguments: serde_json::Value,
    /// Scoped workload token, when the node requested one.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub tenant_id: String,
    pub pipeline_id: String,
    pub query: String,
    pub top_k: usize,
}

/// Model, tool and retrieval resolution. Provided by the host.
///
/// Implementations must resolve within `tenant_id` only and fail with
/// `StrandError::Resolution` rather than fall back across tenants.
pub trait CapabilityClient: Send + Sync + 'static {
    fn complete(&self, req: CompletionRequest) -> BoxFuture<'_, Result<String>>;

    fn call_tool(&self, call: ToolCall) -> BoxFuture<'_, Result<serde_json::Value>>;

    fn retrieve(&self, req: RetrievalRequest) -> BoxFuture<'_, Result<Vec<serde_json::Value>>>;
}
