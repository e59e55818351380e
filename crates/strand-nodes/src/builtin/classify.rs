//! LLM-routed branching. The answer picks a category handle; anything
//! unrecognised routes to `else`.

use std::collections::HashSet;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use strand_core::error::Result;
use strand_core::traits::{CompletionRequest, NodeExecutor};
use strand_core::{GraphState, NodeContext, NodeOutput, StateUpdate, ValidationResult};

use super::{check_expression, check_template, parse_config, require_non_empty, validate_shape};
use crate::expr;

const ELSE: &str = "else";

#[derive(Debug, Deserialize)]
struct ClassifyConfig {
    #[serde(default)]
    model_id: String,
    categories: Vec<String>,
    /// Expression selecting the text to classify.
    #[serde(default = "default_input")]
    input: String,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default = "default_output_key")]
    output_key: String,
}

fn default_input() -> String { "input".to_string() }
fn default_output_key() -> String { "category".to_string() }

/// LLM-backed router. The model's first answer line is matched against the
/// declared categories; anything else routes to `else`.
pub struct ClassifyNode;

impl ClassifyNode {
    /// Exact match first, then case-insensitive.
    pub fn match_category<'c>(answer: &str, categories: &'c [String]) -> Option<&'c str> {
        let answer = answer.lines().next().unwrap_or("").trim().trim_matches(&['"', '\'', '.'][..]);
        categories
            .iter()
            .find(|c| c.as_str() == answer)
            .or_else(|| categories.iter().find(|c| c.eq_ignore_ascii_case(answer)))
            .map(String::as_str)
    }

    fn prompt(cfg: &ClassifyConfig, text: &str) -> String {
        let mut prompt = String::new();
        if let Some(instructions) = &cfg.instructions {
            prompt.push_str(instructions);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Classify the following text into exactly one of these categories: ");
        prompt.push_str(&cfg.categories.join(", "));
        prompt.push_str(".\nAnswer with the category name only.\n\nText:\n");
        prompt.push_str(text);
        prompt
    }
}

impl NodeExecutor for ClassifyNode {
    fn node_type(&self) -> &str {
        "classify"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let Some(cfg) = validate_shape::<ClassifyConfig>(config, &mut result) else {
            return result;
        };
        require_non_empty(&mut result, "model_id", &cfg.model_id);
        if cfg.categories.len() < 2 {
            result.push("categories", "at least 2 categories are required");
        }
        let mut seen = HashSet::new();
        for category in &cfg.categories {
            if category.trim().is_empty() {
                result.push("categories", "category names must not be empty");
            } else if category == ELSE {
                result.push("categories", "'else' is reserved");
            } else if !seen.insert(category.as_str()) {
                result.push("categories", format!("duplicate category '{}'", category));
            }
        }
        check_expression(&mut result, "input", &cfg.input);
        if let Some(instructions) = &cfg.instructions {
            check_template(&mut result, "instructions", instructions);
        }
        result
    }

    fn output_handles(&self, config: &Value) -> Option<Vec<String>> {
        let mut handles: Vec<String> = config
            .get("categories")
            .and_then(Value::as_array)
            .map(|cats| cats.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();
        handles.push(ELSE.to_string());
        Some(handles)
    }

    fn default_handle(&self, _config: &Value) -> Option<String> {
        Some(ELSE.to_string())
    }

    fn execute<'a>(
        &'a self,
        state: &'a GraphState,
        config: &'a Value,
        ctx: &'a NodeContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut cfg: ClassifyConfig = parse_config(&ctx.node_id, config)?;
            if let Some(instructions) = &cfg.instructions {
                cfg.instructions = Some(expr::render_template(instructions, state)?);
            }
            let text = expr::to_display(&expr::evaluate(&cfg.input, state)?);

            let answer = ctx
                .capabilities()?
                .complete(CompletionRequest {
                    tenant_id: ctx.tenant_id.clone(),
                    model_id: cfg.model_id.clone(),
                    prompt: Self::prompt(&cfg, &text),
                    ..CompletionRequest::default()
                })
                .await?;

            let handle = Self::match_category(&answer, &cfg.categories).unwrap_or(ELSE);
            debug!(node_id = %ctx.node_id, category = %handle, "classified");

            let mut update = StateUpdate::new();
            update.insert(cfg.output_key, Value::String(handle.to_string()));
            Ok(NodeOutput::update(update).with_handle(handle))
        })
    }
}
