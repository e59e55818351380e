//! Control-flow nodes: entry/exit, branching, loops, fan-out, approval gates.

use std::collections::HashSet;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::state::{LOOP_COUNTERS_KEY, NODE_OUTPUTS_KEY, OUTPUT_KEY};
use strand_core::traits::NodeExecutor;
use strand_core::{GraphState, NodeContext, NodeOutput, StateUpdate, ValidationResult};

use super::{
    check_expression, check_mapping, check_template, evaluate_mapping, parse_config,
    validate_shape,
};
use crate::expr;

/// Graph entry. The run input is already in state under `input`.
pub struct StartNode;

impl NodeExecutor for StartNode {
    fn node_type(&self) -> &str {
        "start"
    }

    fn validate_config(&self, _config: &Value) -> ValidationResult {
        ValidationResult::ok()
    }

    fn execute<'a>(
        &'a self,
        _state: &'a GraphState,
        _config: &'a Value,
        _ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async { Ok(NodeOutput::empty()) })
    }

    fn is_input(&self) -> bool {
        true
    }
}

#[derive(Deserialize)]
struct EndConfig {
    /// Expression or object of expressions; defaults to the user-visible state.
    #[serde(default)]
    output: Option<Value>,
}

/// Graph exit. Writes the run's final `output`.
pub struct EndNode;

impl NodeExecutor for EndNode {
    fn node_type(&self) -> &str {
        "end"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(cfg) = validate_shape::<EndConfig>(config, &mut result) {
            if let Some(output) = &cfg.output {
                check_mapping(&mut result, "output", output);
            }
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
            let cfg: EndConfig = parse_config(&ctx.node_id, config)?;
            let output = match &cfg.output {
                Some(mapping) => evaluate_mapping(mapping, state)
                    .map_err(|e| StrandError::node(&ctx.node_id, e.to_string()))?,
                _ => {
                    let visible: Map<String, Value> = state
                        .values()
                        .iter()
                        .filter(|(k, _)| {
                            k.as_str() != LOOP_COUNTERS_KEY && k.as_str() != NODE_OUTPUTS_KEY
                        })
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Value::Object(visible)
                }
            };
            let mut update = StateUpdate::new();
            update.insert(OUTPUT_KEY.into(), output);
            Ok(NodeOutput::update(update))
        })
    }

    fn is_output(&self) -> bool {
        true
    }
}

/// Free-text annotation on the canvas. Never executed in practice.
pub struct NoteNode;

impl NodeExecutor for NoteNode {
    fn node_type(&self) -> &str {
        "note"
    }

    fn validate_config(&self, _config: &Value) -> ValidationResult {
        ValidationResult::ok()
    }

    fn execute<'a>(
        &'a self,
        _state: &'a GraphState,
        _config: &'a Value,
        _ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async { Ok(NodeOutput::empty()) })
    }

    fn is_inert(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct Condition {
    name: String,
    expression: String,
}

#[derive(Debug, Deserialize)]
struct IfElseConfig {
    conditions: Vec<Condition>,
}

/// Ordered named conditions; the first true one names the output handle.
pub struct IfElseNode;

impl IfElseNode {
    const ELSE: &'static str = "else";
}

impl NodeExecutor for IfElseNode {
    fn node_type(&self) -> &str {
        "if_else"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<IfElseConfig>(config, &mut result) else {
            return result;
        };
        if cfg.conditions.is_empty() {
            result.push("conditions", "at least one condition is required");
        }
        let mut seen = HashSet::new();
        for (i, cond) in cfg.conditions.iter().enumerate() {
            let field = format!("conditions[{}]", i);
            if cond.name.trim().is_empty() {
                result.push(format!("{}.name", field), "condition name is required");
            } else if cond.name == Self::ELSE {
                result.push(format!("{}.name", field), "'else' is reserved");
            } else if !seen.insert(cond.name.as_str()) {
                result.push(format!("{}.name", field), format!("duplicate condition '{}'", cond.name));
            }
            check_expression(&mut result, &format!("{}.expression", field), &cond.expression);
        }
        result
    }

    fn output_handles(&self, config: &Value) -> Option<Vec<String>> {
        let names = config
            .get("conditions")
            .and_then(Value::as_array)
            .map(|conds| {
                conds
                    .iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Some(names.into_iter().chain([Self::ELSE.to_string()]).collect())
    }

    fn default_handle(&self, _config: &Value) -> Option<String> {
        Some(Self::ELSE.to_string())
    }

    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let cfg: IfElseConfig = parse_config(&ctx.node_id, config)?;
            for cond in &cfg.conditions {
                if expr::evaluate_bool(&cond.expression, state)? {
                    debug!(node_id = %ctx.node_id, branch = %cond.name, "if_else matched");
                    return Ok(NodeOutput::empty().with_handle(cond.name.clone()));
                }
            }
            Ok(NodeOutput::empty().with_handle(Self::ELSE))
        })
    }
}

#[derive(Debug, Deserialize)]
struct WhileConfig {
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    max_iterations: Option<u64>,
}

/// Bounded loop head.
///
/// The counter in `loop_counters[node_id]` is bumped by the runtime when
/// it follows a re-entry edge back into this node. An absent counter means
/// the loop has not started yet.
pub struct WhileNode;

impl WhileNode {
    pub const LOOP: &'static str = "loop";
    pub const EXIT: &'static str = "exit";
}

impl NodeExecutor for WhileNode {
    fn node_type(&self) -> &str {
        "while"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<WhileConfig>(config, &mut result) else {
            return result;
        };
        match cfg.max_iterations {
            None => result.push("max_iterations", "a while loop needs a bound 'max_iterations'"),
            Some(0) => result.push("max_iterations", "'max_iterations' must be at least 1"),
            Some(_) => {}
        }
        if let Some(condition) = &cfg.condition {
            check_expression(&mut result, "condition", condition);
        }
        result
    }

    fn output_handles(&self, _config: &Value) -> Option<Vec<String>> {
        Some(vec![Self::LOOP.to_string(), Self::EXIT.to_string()])
    }

    fn default_handle(&self, _config: &Value) -> Option<String> {
        Some(Self::EXIT.to_string())
    }

    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let cfg: WhileConfig = parse_config(&ctx.node_id, config)?;
            let max = cfg.max_iterations.unwrap_or(1).max(1);

            let Some(count) = state.loop_counter(&ctx.node_id) else {
                return Ok(NodeOutput::empty().with_handle(Self::LOOP));
            };

            let keep_going = match &cfg.condition {
                Some(condition) => expr::evaluate_bool(condition, state)?,
                None => true,
            };

            if keep_going && count < max {
                return Ok(NodeOutput::empty().with_handle(Self::LOOP));
            }

            debug!(node_id = %ctx.node_id, iterations = count, "while loop exiting");
            let mut cleared = Map::new();
            cleared.insert(ctx.node_id.clone(), Value::Null);
            let mut update = StateUpdate::new();
            update.insert(LOOP_COUNTERS_KEY.into(), Value::Object(cleared));
            Ok(NodeOutput::update(update).with_handle(Self::EXIT))
        })
    }
}

/// Unconditional fan-out to every outgoing edge.
///
/// The node itself does nothing; the compiler records which downstream
/// node re-joins its branches and the runtime holds that node back until
/// every branch has arrived.
pub struct ParallelNode;

impl NodeExecutor for ParallelNode {
    fn node_type(&self) -> &str {
        "parallel"
    }

    fn validate_config(&self, _config: &Value) -> ValidationResult {
        ValidationResult::ok()
    }

    fn execute<'a>(
        &'a self,
        _state: &'a GraphState,
        _config: &'a Value,
        _ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async { Ok(NodeOutput::empty()) })
    }
}

#[derive(Debug, Deserialize)]
struct ApprovalConfig {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default = "default_approval_key")]
    output_key: String,
}

fn default_approval_key() -> String { "approval".to_string() }

/// Human gate. Suspends the run on first visit and routes on the resume
/// payload (`{"approved": bool}` or `{"decision": "approve" | "reject"}`).
pub struct ApprovalNode;

impl ApprovalNode {
    pub const APPROVED: &'static str = "approved";
    pub const REJECTED: &'static str = "rejected";

    fn is_approved(payload: &Value) -> bool {
        match payload {
            Value::Bool(b) => *b,
            Value::String(s) => matches!(s.to_lowercase().as_str(), "approve" | "approved" | "yes"),
            Value::Object(map) => {
                if let Some(b) = map.get("approved").and_then(Value::as_bool) {
                    return b;
                }
                map.get("decision").is_some_and(Self::is_approved)
            }
            _ => false,
        }
    }
}

impl NodeExecutor for ApprovalNode {
    fn node_type(&self) -> &str {
        "approval"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(cfg) = validate_shape::<ApprovalConfig>(config, &mut result) {
            if let Some(prompt) = &cfg.prompt {
                check_template(&mut result, "prompt", prompt);
            }
        }
        result
    }

    fn output_handles(&self, _config: &Value) -> Option<Vec<String>> {
        Some(vec![Self::APPROVED.to_string(), Self::REJECTED.to_string()])
    }

    fn default_handle(&self, _config: &Value) -> Option<String> {
        Some(Self::REJECTED.to_string())
    }

    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let cfg: ApprovalConfig = parse_config(&ctx.node_id, config)?;

            let Some(payload) = &ctx.resume_payload else {
                let prompt = match &cfg.prompt {
                    Some(template) => expr::render_template(template, state)?,
                    None => "Approval required".to_string(),
                };
                return Ok(NodeOutput::interrupt(json!({
                    "node_id": ctx.node_id,
                    "prompt": prompt,
                })));
            };

            let handle = if Self::is_approved(payload) {
                Self::APPROVED
            } else {
                Self::REJECTED
            };
            let mut update = StateUpdate::new();
            update.insert(cfg.output_key, payload.clone());
            Ok(NodeOutput::update(update).with_handle(handle))
        })
    }
}
