use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, StrandError};
use crate::event::EventEmitter;
use crate::state::StateUpdate;
use crate::traits::{CapabilityClient, Orchestrator, TokenBroker};

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle state.
///
/// `queued -> running -> {completed, failed, cancelled, paused}`,
/// `paused -> running` on resume. Cancellation is also accepted from
/// `queued` and `paused` so a subtree can be stopped before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Queued, running or paused: the run may still change state.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StrandError::Database(format!("unknown run status '{}'", other))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted agent run. Top-level runs are their own root at depth 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub tenant_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub status: RunStatus,
    pub input_params: serde_json::Value,
    pub output_result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_run_id: Option<RunId>,
    pub root_run_id: RunId,
    pub depth: u32,
    pub orchestration_group_id: Option<String>,
    pub spawn_key: Option<String>,
    /// Delegation grant the run executes under, if any.
    pub grant_id: Option<String>,
    pub principal_id: Option<String>,
    /// Scopes delegated to this run; children can only narrow them.
    pub delegated_scopes: Vec<String>,
}

impl RunRecord {
    /// A fresh queued top-level run.
    pub fn top_level(
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let id = RunId::new();
        Self {
            root_run_id: id.clone(),
            id,
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            status: RunStatus::Queued,
            input_params: input,
            output_result: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parent_run_id: None,
            depth: 0,
            orchestration_group_id: None,
            spawn_key: None,
            grant_id: None,
            principal_id: None,
            delegated_scopes: vec![],
        }
    }

    /// A queued child of `parent`, inheriting tenant, user and root.
    pub fn child_of(
        parent: &RunRecord,
        id: RunId,
        agent_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id,
            tenant_id: parent.tenant_id.clone(),
            agent_id: agent_id.into(),
            user_id: parent.user_id.clone(),
            status: RunStatus::Queued,
            input_params: input,
            output_result: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            parent_run_id: Some(parent.id.clone()),
            root_run_id: parent.root_run_id.clone(),
            depth: parent.depth + 1,
            orchestration_group_id: None,
            spawn_key: None,
            grant_id: parent.grant_id.clone(),
            principal_id: parent.principal_id.clone(),
            delegated_scopes: vec![],
        }
    }
}

/// One persisted trace span. Unique per `(run_id, span_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub run_id: RunId,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub span_type: String,
    pub inputs: serde_json::Value,
    pub outputs: Option<serde_json::Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Kind of a runtime lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "node_start")]
    NodeStart,
    #[serde(rename = "node_end")]
    NodeEnd,
    #[serde(rename = "token_delta")]
    TokenDelta,
    #[serde(rename = "tool_start")]
    ToolStart,
    #[serde(rename = "tool_end")]
    ToolEnd,
    #[serde(rename = "error")]
    Error,
    /// The run suspended waiting for a resume payload.
    #[serde(rename = "interrupt")]
    Interrupt,
    /// Final event of a successful invocation; `data` holds the output.
    #[serde(rename = "run_end")]
    RunEnd,
    #[serde(rename = "orchestration.spawn_decision")]
    SpawnDecision,
    #[serde(rename = "orchestration.child_lifecycle")]
    ChildLifecycle,
    #[serde(rename = "orchestration.join_decision")]
    JoinDecision,
    #[serde(rename = "orchestration.cancellation_propagation")]
    CancellationPropagation,
    #[serde(rename = "orchestration.policy_deny")]
    PolicyDeny,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeStart => "node_start",
            Self::NodeEnd => "node_end",
            Self::TokenDelta => "token_delta",
            Self::ToolStart => "tool_start",
            Self::ToolEnd => "tool_end",
            Self::Error => "error",
            Self::Interrupt => "interrupt",
            Self::RunEnd => "run_end",
            Self::SpawnDecision => "orchestration.spawn_decision",
            Self::ChildLifecycle => "orchestration.child_lifecycle",
            Self::JoinDecision => "orchestration.join_decision",
            Self::CancellationPropagation => "orchestration.cancellation_propagation",
            Self::PolicyDeny => "orchestration.policy_deny",
        }
    }

    pub fn is_orchestration(&self) -> bool {
        self.as_str().starts_with("orchestration.")
    }
}

/// An item of a runtime event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub event: EventKind,
    pub run_id: RunId,
    pub name: String,
    /// Events without a span id are broadcast but never persisted as spans.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl RuntimeEvent {
    pub fn new(event: EventKind, run_id: RunId, name: impl Into<String>) -> Self {
        Self {
            event,
            run_id,
            name: name.into(),
            span_id: None,
            data: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            parent_ids: vec![],
            timestamp: Utc::now(),
        }
    }

    pub fn with_span(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_parents(mut self, parent_ids: Vec<String>) -> Self {
        self.parent_ids = parent_ids;
        self
    }
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            node_id,
        }
    }

    pub fn warning(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            node_id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A field-level config problem reported by `validate_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: vec![],
        }
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: ValidationResult) {
        if !other.valid {
            self.valid = false;
        }
        self.errors.extend(other.errors);
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::ok()
    }
}

/// What a node executor hands back to the runtime.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub update: StateUpdate,
    /// Selected output handle for branching nodes.
    pub handle: Option<String>,
    /// Set when the node suspends the run; carries the interrupt payload.
    pub interrupt: Option<serde_json::Value>,
}

impl NodeOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn update(update: StateUpdate) -> Self {
        Self {
            update,
            ..Self::default()
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn interrupt(payload: serde_json::Value) -> Self {
        Self {
            interrupt: Some(payload),
            ..Self::default()
        }
    }
}

/// Delegation context handed to every node executor.
#[derive(Clone, Default)]
pub struct AuthContext {
    pub grant_id: Option<String>,
    pub principal_id: Option<String>,
    pub initiator_user_id: String,
    pub run_id: RunId,
    pub scopes: Vec<String>,
    pub broker: Option<Arc<dyn TokenBroker>>,
}

impl AuthContext {
    /// Mint a scoped workload token for this run's grant.
    pub async fn mint_token(
        &self,
        scope_subset: Option<Vec<String>>,
        audience: Option<String>,
    ) -> Result<String> {
        let grant_id = self.grant_id.as_deref().ok_or_else(|| {
            StrandError::Permission(format!("run {} has no delegation grant", self.run_id))
        })?;
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| StrandError::Permission("token broker is not configured".into()))?;
        let scopes = match scope_subset {
            Some(requested) => requested
                .into_iter()
                .filter(|s| self.scopes.contains(s))
                .collect(),
            None => self.scopes.clone(),
        };
        broker.mint(grant_id, scopes, audience).await
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("grant_id", &self.grant_id)
            .field("principal_id", &self.principal_id)
            .field("initiator_user_id", &self.initiator_user_id)
            .field("run_id", &self.run_id)
            .field("scopes", &self.scopes)
            .field("broker", &self.broker.is_some())
            .finish()
    }
}

/// Context passed to node executors during execution.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub tenant_id: String,
    pub agent_id: String,
    pub node_id: String,
    /// Span of this node execution; tool spans hang off it.
    pub span_id: String,
    pub auth: AuthContext,
    pub emitter: EventEmitter,
    pub orchestrator: Option<Arc<dyn Orchestrator>>,
    pub capabilities: Option<Arc<dyn CapabilityClient>>,
    /// Resume payload, present only for the node that interrupted.
    pub resume_payload: Option<serde_json::Value>,
    pub cancel: CancellationToken,
}

impl NodeContext {
    /// A bare context for a single node; used by tests and tooling.
    pub fn detached(node_id: impl Into<String>) -> Self {
        let run_id = RunId::new();
        let node_id = node_id.into();
        Self {
            auth: AuthContext {
                run_id: run_id.clone(),
                ..AuthContext::default()
            },
            run_id,
            tenant_id: String::new(),
            agent_id: String::new(),
            span_id: node_id.clone(),
            node_id,
            emitter: EventEmitter::noop(),
            orchestrator: None,
            capabilities: None,
            resume_payload: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn capabilities(&self) -> Result<&Arc<dyn CapabilityClient>> {
        self.capabilities.as_ref().ok_or_else(|| {
            StrandError::Resolution("no capability client configured for this run".into())
        })
    }

    pub fn orchestrator(&self) -> Result<&Arc<dyn Orchestrator>> {
        self.orchestrator.as_ref().ok_or_else(|| {
            StrandError::Permission("orchestration kernel is not available to this run".into())
        })
    }

    /// Emit an event attributed to this node's run.
    pub fn emit(&self, event: EventKind, name: impl Into<String>, data: serde_json::Value) {
        self.emitter.emit(
            RuntimeEvent::new(event, self.run_id.clone(), name)
                .with_data(data)
                .with_parents(vec![self.node_id.clone()]),
        );
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("run_id", &self.run_id)
            .field("tenant_id", &self.tenant_id)
            .field("node_id", &self.node_id)
            .field("span_id", &self.span_id)
            .field("auth", &self.auth)
            .field("orchestrator", &self.orchestrator.is_some())
            .field("capabilities", &self.capabilities.is_some())
            .field("resume_payload", &self.resume_payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Paused));
    }

    #[test]
    fn status_roundtrip_strings() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::parse("bogus").is_err());
    }

    #[test]
    fn child_inherits_lineage() {
        let parent = RunRecord::top_level("t1", "orchestrator", "u1", serde_json::json!({}));
        assert_eq!(parent.root_run_id, parent.id);

        let child = RunRecord::child_of(&parent, RunId::new(), "worker", serde_json::json!({}));
        assert_eq!(child.parent_run_id.as_ref(), Some(&parent.id));
        assert_eq!(child.root_run_id, parent.id);
        assert_eq!(child.depth, 1);
        assert_eq!(child.tenant_id, "t1");
    }

    #[test]
    fn event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::PolicyDeny).unwrap();
        assert_eq!(json, "\"orchestration.policy_deny\"");
        assert!(EventKind::JoinDecision.is_orchestration());
        assert!(!EventKind::NodeEnd.is_orchestration());
    }

    #[tokio::test]
    async fn mint_token_requires_grant() {
        let auth = AuthContext::default();
        let err = auth.mint_token(None, None).await.unwrap_err();
        assert!(err.is_permission());
    }
}
