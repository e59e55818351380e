//! Graph-level orchestration primitives. Thin wrappers over the kernel:
//! build a request from config and state, call, write the result back.
//! Policy denials surface unchanged so the run fails with them.

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use strand_core::error::{Result, StrandError};
use strand_core::state::LOOP_COUNTERS_KEY;
use strand_core::orchestration::{
    FailurePolicy, GroupTarget, JoinMode, JoinRequest, SpawnGroupRequest, SpawnRequest, TargetRef,
};
use strand_core::traits::NodeExecutor;
use strand_core::{GraphState, NodeContext, NodeOutput, StateUpdate, ValidationResult};

use super::{check_expression, check_mapping, check_template, evaluate_mapping, parse_config, validate_shape};
use crate::expr;

const DISABLED: &str = "orchestration primitives are disabled";

fn disabled_result() -> ValidationResult {
    let mut result = ValidationResult::ok();
    result.push("type", DISABLED);
    result
}

fn ensure_enabled(enabled: bool) -> Result<()> {
    if enabled {
        Ok(())
    } else {
        Err(StrandError::Permission(DISABLED.into()))
    }
}

#[derive(Debug, Deserialize)]
struct TargetConfig {
    #[serde(default)]
    target_agent_id: Option<String>,
    #[serde(default)]
    target_slug: Option<String>,
    /// Expression, object of expressions, or absent for the run input.
    #[serde(default)]
    input: Option<Value>,
}

impl TargetConfig {
    fn target(&self) -> Option<TargetRef> {
        match (&self.target_agent_id, &self.target_slug) {
            (Some(id), None) => Some(TargetRef::AgentId(id.clone())),
            (None, Some(slug)) => Some(TargetRef::Slug(slug.clone())),
            _ => None,
        }
    }

    fn validate(&self, result: &mut ValidationResult, field: &str) {
        if self.target().is_none() {
            result.push(
                field,
                "exactly one of 'target_agent_id' or 'target_slug' is required",
            );
        }
        if let Some(input) = &self.input {
            check_mapping(result, &format!("{}.input", field), input);
        }
    }

    fn mapped_input(&self, state: &GraphState) -> Result<Value> {
        match &self.input {
            Some(mapping) => evaluate_mapping(mapping, state),
            None => Ok(state.input().clone()),
        }
    }
}

/// `node_id`, qualified by every live loop counter, so each iteration of an
/// enclosing `while` gets its own key while a replayed visit reuses it.
fn visit_key(node_id: &str, state: &GraphState) -> String {
    let mut key = node_id.to_string();
    if let Some(Value::Object(counters)) = state.get(LOOP_COUNTERS_KEY) {
        let mut live: Vec<(&String, u64)> = counters
            .iter()
            .filter_map(|(loop_id, n)| n.as_u64().map(|n| (loop_id, n)))
            .collect();
        live.sort();
        for (loop_id, n) in live {
            key.push_str(&format!("@{}={}", loop_id, n));
        }
    }
    key
}

/// Render an optional key template, falling back to a node-derived default.
fn render_key(template: Option<&str>, fallback: String, state: &GraphState) -> Result<String> {
    match template {
        Some(t) => expr::render_template(t, state),
        None => Ok(fallback),
    }
}

#[derive(Debug, Deserialize)]
struct SpawnRunConfig {
    #[serde(flatten)]
    target: TargetConfig,
    #[serde(default)]
    failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    timeout_s: Option<u64>,
    #[serde(default)]
    scope_subset: Option<Vec<String>>,
    /// Template; defaults to the node id (plus loop iteration) so a retried
    /// visit reuses its child.
    #[serde(default)]
    idempotency_key: Option<String>,
    /// Expression yielding a group id to attach the child to.
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default = "default_spawn_key")]
    output_key: String,
}

fn default_spawn_key() -> String { "spawned_run_id".to_string() }

/// Spawn one child run.
pub struct SpawnRunNode {
    enabled: bool,
}

impl SpawnRunNode {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl NodeExecutor for SpawnRunNode {
    fn node_type(&self) -> &str {
        "spawn_run"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        if !self.enabled {
            return disabled_result();
        }
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<SpawnRunConfig>(config, &mut result) else {
            return result;
        };
        cfg.target.validate(&mut result, "target");
        if let Some(key) = &cfg.idempotency_key {
            check_template(&mut result, "idempotency_key", key);
        }
        if let Some(group) = &cfg.group_id {
            check_expression(&mut result, "group_id", group);
        }
        result
    }

    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            ensure_enabled(self.enabled)?;
            let cfg: SpawnRunConfig = parse_config(&ctx.node_id, config)?;
            let target = cfg
                .target
                .target()
                .ok_or_else(|| StrandError::node(&ctx.node_id, "spawn target is not set"))?;
            let group_id = match &cfg.group_id {
                Some(source) => expr::evaluate(source, state)?.as_str().map(String::from),
                None => None,
            };

            let request = SpawnRequest {
                caller_run_id: ctx.run_id.clone(),
                parent_node_id: Some(ctx.node_id.clone()),
                target,
                input: cfg.target.mapped_input(state)?,
                failure_policy: cfg.failure_policy,
                timeout_s: cfg.timeout_s,
                scope_subset: cfg.scope_subset,
                idempotency_key: Some(render_key(
                    cfg.idempotency_key.as_deref(),
                    visit_key(&ctx.node_id, state),
                    state,
                )?),
                group_id,
            };
            let outcome = ctx.orchestrator()?.spawn_run(request).await?;
            info!(
                run_id = %ctx.run_id,
                node_id = %ctx.node_id,
                idempotent = outcome.idempotent,
                "spawn_run node completed"
            );

            let child = outcome
                .spawned_run_ids
                .first()
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null);
            let mut update = StateUpdate::new();
            update.insert(cfg.output_key, child);
            update.insert("spawn".into(), serde_json::to_value(&outcome)?);
            Ok(NodeOutput::update(update))
        })
    }

    fn is_orchestration(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct SpawnGroupConfig {
    targets: Vec<TargetConfig>,
    /// Template; defaults to `<node_id>:`, loop-qualified like spawn keys.
    #[serde(default)]
    idempotency_key_prefix: Option<String>,
    #[serde(default)]
    join_mode: JoinMode,
    #[serde(default)]
    quorum_threshold: Option<u32>,
    #[serde(default)]
    failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    timeout_s: Option<u64>,
    #[serde(default)]
    scope_subset: Option<Vec<String>>,
    #[serde(default = "default_group_key")]
    output_key: String,
}

fn default_group_key() -> String { "group_id".to_string() }

/// Fan out to several children under one joinable group.
pub struct SpawnGroupNode {
    enabled: bool,
}

impl SpawnGroupNode {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl NodeExecutor for SpawnGroupNode {
    fn node_type(&self) -> &str {
        "spawn_group"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        if !self.enabled {
            return disabled_result();
        }
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<SpawnGroupConfig>(config, &mut result) else {
            return result;
        };
        if cfg.targets.is_empty() {
            result.push("targets", "at least one target is required");
        }
        for (i, target) in cfg.targets.iter().enumerate() {
            target.validate(&mut result, &format!("targets[{}]", i));
        }
        if cfg.join_mode == JoinMode::Quorum {
            match cfg.quorum_threshold {
                Some(n) if n >= 1 && n as usize <= cfg.targets.len() => {}
                _ => result.push(
                    "quorum_threshold",
                    "quorum mode needs a threshold between 1 and the number of targets",
                ),
            }
        }
        if let Some(prefix) = &cfg.idempotency_key_prefix {
            check_template(&mut result, "idempotency_key_prefix", prefix);
        }
        result
    }

    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            ensure_enabled(self.enabled)?;
            let cfg: SpawnGroupConfig = parse_config(&ctx.node_id, config)?;

            let mut targets = Vec::with_capacity(cfg.targets.len());
            for (i, t) in cfg.targets.iter().enumerate() {
                let target = t.target().ok_or_else(|| {
                    StrandError::node(&ctx.node_id, format!("targets[{}] has no target", i))
                })?;
                targets.push(GroupTarget {
                    target,
                    input: t.mapped_input(state)?,
                });
            }

            let request = SpawnGroupRequest {
                caller_run_id: ctx.run_id.clone(),
                parent_node_id: Some(ctx.node_id.clone()),
                targets,
                idempotency_key_prefix: Some(render_key(
                    cfg.idempotency_key_prefix.as_deref(),
                    format!("{}:", visit_key(&ctx.node_id, state)),
                    state,
                )?),
                join_mode: cfg.join_mode,
                quorum_threshold: cfg.quorum_threshold,
                failure_policy: cfg.failure_policy,
                timeout_s: cfg.timeout_s,
                scope_subset: cfg.scope_subset,
            };
            let outcome = ctx.orchestrator()?.spawn_group(request).await?;

            let mut update = StateUpdate::new();
            update.insert(cfg.output_key, Value::String(outcome.group_id.clone()));
            update.insert(
                "spawned_run_ids".into(),
                json!(outcome
                    .spawned_run_ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()),
            );
            Ok(NodeOutput::update(update))
        })
    }

    fn is_orchestration(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct JoinConfig {
    /// Expression yielding the group id.
    #[serde(default = "default_group_key")]
    group_id: String,
    #[serde(default)]
    mode: Option<JoinMode>,
    #[serde(default)]
    quorum_threshold: Option<u32>,
    #[serde(default = "default_join_key")]
    output_key: String,
}

fn default_join_key() -> String { "join".to_string() }

/// Block until a group satisfies its join condition (or times out).
///
/// A failed or timed-out join is a result, not an error; branch on
/// `join.status` downstream.
pub struct JoinNode {
    enabled: bool,
}

impl JoinNode {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl NodeExecutor for JoinNode {
    fn node_type(&self) -> &str {
        "join"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        if !self.enabled {
            return disabled_result();
        }
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<JoinConfig>(config, &mut result) else {
            return result;
        };
        check_expression(&mut result, "group_id", &cfg.group_id);
        if cfg.mode == Some(JoinMode::Quorum) && cfg.quorum_threshold.unwrap_or(0) == 0 {
            result.push("quorum_threshold", "quorum mode needs a positive threshold");
        }
        result
    }

    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            ensure_enabled(self.enabled)?;
            let cfg: JoinConfig = parse_config(&ctx.node_id, config)?;
            let group_id = match expr::evaluate(&cfg.group_id, state)? {
                Value::String(id) if !id.is_empty() => id,
                other => {
                    return Err(StrandError::node(
                        &ctx.node_id,
                        format!("'{}' did not yield a group id (got {})", cfg.group_id, other),
                    ))
                }
            };

            let outcome = ctx
                .orchestrator()?
                .join(JoinRequest {
                    caller_run_id: ctx.run_id.clone(),
                    group_id,
                    mode: cfg.mode,
                    quorum_threshold: cfg.quorum_threshold,
                })
                .await?;

            let mut update = StateUpdate::new();
            update.insert(cfg.output_key, serde_json::to_value(&outcome)?);
            Ok(NodeOutput::update(update))
        })
    }

    fn is_orchestration(&self) -> bool {
        true
    }
}
