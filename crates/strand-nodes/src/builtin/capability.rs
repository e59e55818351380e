//! Nodes that call out to models, tools and retrieval pipelines through the
//! run's `CapabilityClient`.

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{CompletionRequest, NodeExecutor, RetrievalRequest, ToolCall};
use strand_core::{
    EventKind, GraphState, NodeContext, NodeOutput, RuntimeEvent, StateUpdate, ValidationResult,
};

use super::{check_mapping, check_template, evaluate_mapping, parse_config, require_non_empty, validate_shape};
use crate::expr;

fn single(key: String, value: Value) -> StateUpdate {
    let mut update = StateUpdate::new();
    update.insert(key, value);
    update
}

#[derive(Debug, Deserialize)]
struct LlmConfig {
    #[serde(default)]
    model_id: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default = "default_response_key")]
    output_key: String,
}

fn default_response_key() -> String { "response".to_string() }

/// Single model completion over a prompt template.
pub struct LlmNode;

impl NodeExecutor for LlmNode {
    fn node_type(&self) -> &str {
        "llm"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<LlmConfig>(config, &mut result) else {
            return result;
        };
        require_non_empty(&mut result, "model_id", &cfg.model_id);
        require_non_empty(&mut result, "prompt", &cfg.prompt);
        check_template(&mut result, "prompt", &cfg.prompt);
        if let Some(system) = &cfg.system {
            check_template(&mut result, "system", system);
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
            let cfg: LlmConfig = parse_config(&ctx.node_id, config)?;
            let system = cfg
                .system
                .as_deref()
                .map(|s| expr::render_template(s, state))
                .transpose()?;
            let request = CompletionRequest {
                tenant_id: ctx.tenant_id.clone(),
                model_id: cfg.model_id,
                system,
                prompt: expr::render_template(&cfg.prompt, state)?,
                tools: vec![],
                max_tokens: cfg.max_tokens,
            };
            let text = ctx.capabilities()?.complete(request).await?;
            ctx.emit(EventKind::TokenDelta, &ctx.node_id, json!({"text": text}));
            Ok(NodeOutput::update(single(cfg.output_key, Value::String(text))))
        })
    }
}

#[derive(Debug, Deserialize)]
struct AgentConfig {
    #[serde(default)]
    model_id: String,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default = "default_agent_prompt")]
    prompt: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default = "default_response_key")]
    output_key: String,
}

fn default_agent_prompt() -> String { "{{ input }}".to_string() }

/// Tool-using model call. The tool loop itself belongs to the capability
/// client; this node only scopes which tools the model may reach.
pub struct AgentNode;

impl NodeExecutor for AgentNode {
    fn node_type(&self) -> &str {
        "agent"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<AgentConfig>(config, &mut result) else {
            return result;
        };
        require_non_empty(&mut result, "model_id", &cfg.model_id);
        check_template(&mut result, "prompt", &cfg.prompt);
        if let Some(instructions) = &cfg.instructions {
            check_template(&mut result, "instructions", instructions);
        }
        if cfg.tools.iter().any(|t| t.trim().is_empty()) {
            result.push("tools", "tool ids must not be empty");
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
            let cfg: AgentConfig = parse_config(&ctx.node_id, config)?;
            let system = cfg
                .instructions
                .as_deref()
                .map(|s| expr::render_template(s, state))
                .transpose()?;
            let request = CompletionRequest {
                tenant_id: ctx.tenant_id.clone(),
                model_id: cfg.model_id,
                system,
                prompt: expr::render_template(&cfg.prompt, state)?,
                tools: cfg.tools,
                max_tokens: cfg.max_tokens,
            };
            debug!(node_id = %ctx.node_id, tools = request.tools.len(), "Agent node calling model");
            let text = ctx.capabilities()?.complete(request).await?;
            Ok(NodeOutput::update(single(cfg.output_key, Value::String(text))))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToolConfig {
    #[serde(default)]
    tool_id: String,
    /// Expressions (or literals) evaluated into the tool arguments.
    #[serde(default)]
    arguments: Map<String, Value>,
    /// Request a scoped workload token for the call.
    #[serde(default)]
    use_token: bool,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(default)]
    audience: Option<String>,
    #[serde(default)]
    timeout_s: Option<u64>,
    #[serde(default = "default_tool_key")]
    output_key: String,
}

fn default_tool_key() -> String { "tool_result".to_string() }

/// Direct tool invocation, optionally under a minted token and a timeout.
pub struct ToolNode;

impl NodeExecutor for ToolNode {
    fn node_type(&self) -> &str {
        "tool"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<ToolConfig>(config, &mut result) else {
            return result;
        };
        require_non_empty(&mut result, "tool_id", &cfg.tool_id);
        for (key, value) in &cfg.arguments {
            check_mapping(&mut result, &format!("arguments.{}", key), value);
        }
        if cfg.timeout_s == Some(0) {
            result.push("timeout_s", "'timeout_s' must be positive");
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
            let cfg: ToolConfig = parse_config(&ctx.node_id, config)?;
            let arguments = evaluate_mapping(&Value::Object(cfg.arguments.clone()), state)?;

            let token = if cfg.use_token || cfg.scopes.is_some() || cfg.audience.is_some() {
                Some(ctx.auth.mint_token(cfg.scopes.clone(), cfg.audience.clone()).await?)
            } else {
                None
            };

            let span_id = format!("tool:{}", Uuid::new_v4());
            ctx.emitter.emit(
                RuntimeEvent::new(EventKind::ToolStart, ctx.run_id.clone(), &cfg.tool_id)
                    .with_span(span_id.clone())
                    .with_data(json!({"arguments": arguments}))
                    .with_parents(vec![ctx.span_id.clone()]),
            );

            let call = ToolCall {
                tenant_id: ctx.tenant_id.clone(),
                tool_id: cfg.tool_id.clone(),
                arguments,
                token,
            };
            let capabilities = ctx.capabilities()?;
            let result = match cfg.timeout_s {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs(secs), capabilities.call_tool(call)).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(node_id = %ctx.node_id, tool = %cfg.tool_id, secs, "Tool timed out");
                            Err(StrandError::Timeout {
                                what: format!("tool '{}'", cfg.tool_id),
                                timeout_secs: secs,
                            })
                        }
                    }
                }
                None => capabilities.call_tool(call).await,
            };

            let end_data = match &result {
                Ok(output) => json!({"output": output}),
                Err(e) => json!({"error": e.to_string()}),
            };
            ctx.emitter.emit(
                RuntimeEvent::new(EventKind::ToolEnd, ctx.run_id.clone(), &cfg.tool_id)
                    .with_span(span_id)
                    .with_data(end_data)
                    .with_parents(vec![ctx.span_id.clone()]),
            );

            Ok(NodeOutput::update(single(cfg.output_key, result?)))
        })
    }
}

#[derive(Debug, Deserialize)]
struct RetrievalConfig {
    #[serde(default)]
    pipeline_id: String,
    #[serde(default = "default_query")]
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_documents_key")]
    output_key: String,
}

fn default_query() -> String { "{{ input }}".to_string() }
fn default_top_k() -> usize { 5 }
fn default_documents_key() -> String { "documents".to_string() }

/// Query a retrieval pipeline.
pub struct RetrievalNode;

impl NodeExecutor for RetrievalNode {
    fn node_type(&self) -> &str {
        "retrieval"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<RetrievalConfig>(config, &mut result) else {
            return result;
        };
        require_non_empty(&mut result, "pipeline_id", &cfg.pipeline_id);
        check_template(&mut result, "query", &cfg.query);
        if cfg.top_k == 0 {
            result.push("top_k", "'top_k' must be at least 1");
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
            let cfg: RetrievalConfig = parse_config(&ctx.node_id, config)?;
            let request = RetrievalRequest {
                tenant_id: ctx.tenant_id.clone(),
                pipeline_id: cfg.pipeline_id,
                query: expr::render_template(&cfg.query, state)?,
                top_k: cfg.top_k,
            };
            let hits = ctx.capabilities()?.retrieve(request).await?;
            Ok(NodeOutput::update(single(cfg.output_key, Value::Array(hits))))
        })
    }
}
