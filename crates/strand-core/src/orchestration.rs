//! Orchestration data model shared by the kernel and node executors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};
use crate::types::{RunId, RunStatus};

/// How a `join` decides the group is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Wait for every member.
    #[default]
    All,
    /// First success completes the join.
    Any,
    /// `quorum_threshold` successes complete the join.
    Quorum,
    /// First failure fails the join and cancels the rest.
    FailFast,
}

impl JoinMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
            Self::Quorum => "quorum",
            Self::FailFast => "fail_fast",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            "quorum" => Ok(Self::Quorum),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(StrandError::Config(format!("unknown join mode '{}'", other))),
        }
    }
}

/// Group outcome when members fail under `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any member failure fails the group.
    #[default]
    FailGroup,
    /// The group succeeds if at least one member succeeded.
    BestEffort,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailGroup => "fail_group",
            Self::BestEffort => "best_effort",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fail_group" => Ok(Self::FailGroup),
            "best_effort" => Ok(Self::BestEffort),
            other => Err(StrandError::Config(format!("unknown failure policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(StrandError::Database(format!("unknown group status '{}'", other))),
        }
    }
}

/// What happens to still-queued members when a join cancels the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingMemberPolicy {
    /// Cancel them before they ever start.
    #[default]
    Cancel,
    /// Let them run; they are not reported as cancelled.
    Detach,
}

/// Per (tenant, orchestrator agent) limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorPolicy {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_fanout")]
    pub max_fanout: u32,
    #[serde(default = "default_max_children_total")]
    pub max_children_total: u32,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_s: u64,
    #[serde(default)]
    pub default_failure_policy: FailurePolicy,
    /// `None` leaves scopes unrestricted by policy.
    #[serde(default)]
    pub allowed_scope_subset: Option<Vec<String>>,
    #[serde(default = "default_enforce_published_only")]
    pub enforce_published_only: bool,
}

fn default_max_depth() -> u32 { 3 }
fn default_max_fanout() -> u32 { 10 }
fn default_max_children_total() -> u32 { 50 }
fn default_join_timeout() -> u64 { 600 }
fn default_enforce_published_only() -> bool { true }

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_fanout: default_max_fanout(),
            max_children_total: default_max_children_total(),
            join_timeout_s: default_join_timeout(),
            default_failure_policy: FailurePolicy::default(),
            allowed_scope_subset: None,
            enforce_published_only: default_enforce_published_only(),
        }
    }
}

/// One allow-list row. At least one of the target fields is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    #[serde(default)]
    pub id: i64,
    pub tenant_id: String,
    pub orchestrator_agent_id: String,
    #[serde(default)]
    pub target_agent_id: Option<String>,
    #[serde(default)]
    pub target_agent_slug: Option<String>,
    #[serde(default)]
    pub capability_tag: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool { true }

impl AllowlistEntry {
    pub fn for_agent(
        tenant_id: impl Into<String>,
        orchestrator: impl Into<String>,
        target_agent_id: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            tenant_id: tenant_id.into(),
            orchestrator_agent_id: orchestrator.into(),
            target_agent_id: Some(target_agent_id.into()),
            target_agent_slug: None,
            capability_tag: None,
            enabled: true,
        }
    }

    pub fn for_capability(
        tenant_id: impl Into<String>,
        orchestrator: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            tenant_id: tenant_id.into(),
            orchestrator_agent_id: orchestrator.into(),
            target_agent_id: None,
            target_agent_slug: None,
            capability_tag: Some(tag.into()),
            enabled: true,
        }
    }

    /// Whether this enabled row admits the given agent.
    pub fn admits(&self, agent_id: &str, slug: &str, capability_tags: &[String]) -> bool {
        if !self.enabled {
            return false;
        }
        self.target_agent_id.as_deref() == Some(agent_id)
            || self.target_agent_slug.as_deref() == Some(slug)
            || self
                .capability_tag
                .as_ref()
                .is_some_and(|tag| capability_tags.contains(tag))
    }
}

/// Spawn target, by id or by slug within the caller's tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRef {
    AgentId(String),
    Slug(String),
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentId(id) => write!(f, "agent:{}", id),
            Self::Slug(slug) => write!(f, "slug:{}", slug),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub caller_run_id: RunId,
    #[serde(default)]
    pub parent_node_id: Option<String>,
    pub target: TargetRef,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub scope_subset: Option<Vec<String>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Attach the child to an existing group.
    #[serde(default)]
    pub group_id: Option<String>,
}

impl SpawnRequest {
    pub fn new(caller_run_id: RunId, target: TargetRef, input: serde_json::Value) -> Self {
        Self {
            caller_run_id,
            parent_node_id: None,
            target,
            input,
            failure_policy: None,
            timeout_s: None,
            scope_subset: None,
            idempotency_key: None,
            group_id: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scope_subset = Some(scopes);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnOutcome {
    pub spawned_run_ids: Vec<RunId>,
    pub idempotent: bool,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub effective_scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupTarget {
    pub target: TargetRef,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnGroupRequest {
    pub caller_run_id: RunId,
    #[serde(default)]
    pub parent_node_id: Option<String>,
    pub targets: Vec<GroupTarget>,
    #[serde(default)]
    pub idempotency_key_prefix: Option<String>,
    #[serde(default)]
    pub join_mode: JoinMode,
    #[serde(default)]
    pub quorum_threshold: Option<u32>,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub scope_subset: Option<Vec<String>>,
}

impl SpawnGroupRequest {
    pub fn new(caller_run_id: RunId, targets: Vec<GroupTarget>) -> Self {
        Self {
            caller_run_id,
            parent_node_id: None,
            targets,
            idempotency_key_prefix: None,
            join_mode: JoinMode::All,
            quorum_threshold: None,
            failure_policy: None,
            timeout_s: None,
            scope_subset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnGroupOutcome {
    pub group_id: String,
    pub spawned_run_ids: Vec<RunId>,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub caller_run_id: RunId,
    pub group_id: String,
    /// Overrides the mode recorded on the group.
    #[serde(default)]
    pub mode: Option<JoinMode>,
    #[serde(default)]
    pub quorum_threshold: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationPropagated {
    pub count: usize,
    pub run_ids: Vec<RunId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberResult {
    pub run_id: RunId,
    pub ordinal: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOutcome {
    pub group_id: String,
    pub status: GroupStatus,
    pub complete: bool,
    pub success_count: u32,
    pub failure_count: u32,
    pub running_count: u32,
    pub cancellation_propagated: Option<CancellationPropagated>,
    pub members: Vec<MemberResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub cancelled_run_ids: Vec<RunId>,
    pub already_terminal: Vec<RunId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanAction {
    /// The group already meets its join condition.
    Satisfied,
    /// Failed members were re-spawned.
    Retry,
    /// Failures remain and no attempts are left.
    Abort,
    /// Members are still running.
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplanOutcome {
    pub group_id: String,
    pub action: ReplanAction,
    pub respawned_run_ids: Vec<RunId>,
    pub success_count: u32,
    pub failure_count: u32,
    pub running_count: u32,
}

/// A persisted orchestration group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationGroup {
    pub id: String,
    pub orchestrator_run_id: RunId,
    pub parent_node_id: Option<String>,
    pub idempotency_prefix: Option<String>,
    pub failure_policy: FailurePolicy,
    pub join_mode: JoinMode,
    pub quorum_threshold: Option<u32>,
    pub timeout_s: u64,
    pub status: GroupStatus,
    pub policy_snapshot: OrchestratorPolicy,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One spawned child of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: String,
    pub run_id: RunId,
    pub ordinal: u32,
    pub status: RunStatus,
    pub target: TargetRef,
    pub input: serde_json::Value,
    pub spawn_key: Option<String>,
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_matching() {
        let by_id = AllowlistEntry::for_agent("t1", "orch", "worker");
        assert!(by_id.admits("worker", "w", &[]));
        assert!(!by_id.admits("other", "w", &[]));

        let by_tag = AllowlistEntry::for_capability("t1", "orch", "search");
        assert!(by_tag.admits("x", "x", &["search".into()]));
        assert!(!by_tag.admits("x", "x", &["write".into()]));

        let mut disabled = AllowlistEntry::for_agent("t1", "orch", "worker");
        disabled.enabled = false;
        assert!(!disabled.admits("worker", "w", &[]));
    }

    #[test]
    fn target_ref_wire_format() {
        let t: TargetRef = serde_json::from_str(r#"{"slug": "summarizer"}"#).unwrap();
        assert_eq!(t, TargetRef::Slug("summarizer".into()));
        let t: TargetRef = serde_json::from_str(r#"{"agent_id": "a-1"}"#).unwrap();
        assert_eq!(t, TargetRef::AgentId("a-1".into()));
    }

    #[test]
    fn policy_defaults_fill_missing_fields() {
        let p: OrchestratorPolicy = serde_json::from_str(r#"{"max_depth": 1}"#).unwrap();
        assert_eq!(p.max_depth, 1);
        assert_eq!(p.max_fanout, 10);
        assert!(p.enforce_published_only);
        assert!(p.allowed_scope_subset.is_none());
    }

    #[test]
    fn mode_strings() {
        for mode in [JoinMode::All, JoinMode::Any, JoinMode::Quorum, JoinMode::FailFast] {
            assert_eq!(JoinMode::parse(mode.as_str()).unwrap(), mode);
        }
        assert!(JoinMode::parse("majority").is_err());
    }
}
