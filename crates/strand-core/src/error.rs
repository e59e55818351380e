use thiserror::Error;

use crate::types::{Diagnostic, Severity};

#[derive(Debug, Error)]
pub enum StrandError {
    // Compile-time errors
    #[error("Graph validation failed: {}", summarize(.0))]
    Validation(Vec<Diagnostic>),

    #[error("Expression error: {0}")]
    Expression(String),

    // Lookup errors
    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Policy errors
    #[error("Permission denied: {0}")]
    Permission(String),

    // Execution errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Timed out after {timeout_secs}s: {what}")]
    Timeout { what: String, timeout_secs: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Runtime error: {0}")]
    Runtime(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrandError {
    /// Policy and scope denials. These always fail closed.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Permission(_))
    }

    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            message: message.into(),
        }
    }
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    let errors: Vec<&str> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.as_str())
        .collect();
    match errors.len() {
        0 => "no errors".to_string(),
        1 => errors[0].to_string(),
        n => format!("{} errors; first: {}", n, errors[0]),
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;
