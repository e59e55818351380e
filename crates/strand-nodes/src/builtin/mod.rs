pub mod capability;
pub mod classify;
pub mod control;
pub mod data;
pub mod orchestration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use strand_core::error::{Result, StrandError};
use strand_core::{GraphState, ValidationResult};

use crate::expr;

/// A missing config is treated as an empty object.
fn normalized(config: &Value) -> Value {
    if config.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    }
}

/// Deserialize a node config, reporting failure as a field error.
pub(crate) fn validate_shape<T: DeserializeOwned>(
    config: &Value,
    result: &mut ValidationResult,
) -> Option<T> {
    match serde_json::from_value(normalized(config)) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            result.push("config", e.to_string());
            None
        }
    }
}

/// Deserialize a node config at execution time.
pub(crate) fn parse_config<T: DeserializeOwned>(node_id: &str, config: &Value) -> Result<T> {
    serde_json::from_value(normalized(config))
        .map_err(|e| StrandError::node(node_id, format!("invalid config: {}", e)))
}

pub(crate) fn check_expression(result: &mut ValidationResult, field: &str, source: &str) {
    if let Err(e) = expr::parse(source) {
        result.push(field, e.to_string());
    }
}

pub(crate) fn check_template(result: &mut ValidationResult, field: &str, template: &str) {
    if let Err(e) = expr::check_template(template) {
        result.push(field, e.to_string());
    }
}

pub(crate) fn require_non_empty(result: &mut ValidationResult, field: &str, value: &str) {
    if value.trim().is_empty() {
        result.push(field, format!("'{}' is required", field));
    }
}

/// Evaluate a mapping value: strings are expressions, everything else is
/// taken literally. Objects are evaluated per field.
pub(crate) fn evaluate_mapping(value: &Value, state: &GraphState) -> Result<Value> {
    match value {
        Value::String(source) => expr::evaluate(source, state),
        Value::Object(fields) => {
            let mut out = serde_json::Map::new();
            for (key, field) in fields {
                out.insert(key.clone(), evaluate_mapping(field, state)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Validate every expression inside a mapping value.
pub(crate) fn check_mapping(result: &mut ValidationResult, field: &str, value: &Value) {
    match value {
        Value::String(source) => check_expression(result, field, source),
        Value::Object(fields) => {
            for (key, inner) in fields {
                check_mapping(result, &format!("{}.{}", field, key), inner);
            }
        }
        _ => {}
    }
}
