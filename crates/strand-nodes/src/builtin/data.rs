//! State-mutating nodes. A failing mapping never fails the node: its key is
//! set to `null` and `_error_<key>` carries the message.

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use strand_core::error::Result;
use strand_core::traits::NodeExecutor;
use strand_core::{GraphState, NodeContext, NodeOutput, StateUpdate, ValidationResult};

use super::{check_mapping, evaluate_mapping, parse_config, validate_shape};

/// Evaluate each mapping in isolation.
fn apply_mappings(node_id: &str, mappings: &Map<String, Value>, state: &GraphState) -> StateUpdate {
    let mut update = StateUpdate::new();
    for (key, mapping) in mappings {
        match evaluate_mapping(mapping, state) {
            Ok(value) => {
                update.insert(key.clone(), value);
            }
            Err(e) => {
                warn!(node_id = %node_id, key = %key, error = %e, "Mapping failed");
                update.insert(key.clone(), Value::Null);
                update.insert(format!("_error_{}", key), Value::String(e.to_string()));
            }
        }
    }
    update
}

fn validate_mappings(result: &mut ValidationResult, field: &str, mappings: &Map<String, Value>) {
    if mappings.is_empty() {
        result.push(field, format!("'{}' must declare at least one key", field));
    }
    for (key, mapping) in mappings {
        if key.trim().is_empty() {
            result.push(field, "mapping keys must not be empty");
        }
        check_mapping(result, &format!("{}.{}", field, key), mapping);
    }
}

#[derive(Debug, Deserialize)]
struct TransformConfig {
    mappings: Map<String, Value>,
    /// Nest the results under this key instead of writing them top-level.
    #[serde(default)]
    output_key: Option<String>,
}

/// Derive new values from state.
pub struct TransformNode;

impl NodeExecutor for TransformNode {
    fn node_type(&self) -> &str {
        "transform"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(cfg) = validate_shape::<TransformConfig>(config, &mut result) {
            validate_mappings(&mut result, "mappings", &cfg.mappings);
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
            let cfg: TransformConfig = parse_config(&ctx.node_id, config)?;
            let results = apply_mappings(&ctx.node_id, &cfg.mappings, state);
            let update = match cfg.output_key {
                Some(key) => {
                    let mut nested = StateUpdate::new();
                    nested.insert(key, Value::Object(results));
                    nested
                }
                None => results,
            };
            Ok(NodeOutput::update(update))
        })
    }
}

#[derive(Debug, Deserialize)]
struct SetStateConfig {
    values: Map<String, Value>,
}

/// Assign state keys directly.
pub struct SetStateNode;

impl NodeExecutor for SetStateNode {
    fn node_type(&self) -> &str {
        "set_state"
    }

    fn validate_config(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(cfg) = validate_shape::<SetStateConfig>(config, &mut result) {
            validate_mappings(&mut result, "values", &cfg.values);
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
            let cfg: SetStateConfig = parse_config(&ctx.node_id, config)?;
            Ok(NodeOutput::update(apply_mappings(&ctx.node_id, &cfg.values, state)))
        })
    }
}
