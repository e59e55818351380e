use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};
use crate::orchestration::{OrchestratorPolicy, PendingMemberPolicy};

/// Top-level Strand configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime adapter name, looked up in the adapter registry.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Supersteps allowed per invocation before the run fails.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
    /// Wall-clock limit per run (0 = unlimited).
    #[serde(default)]
    pub run_timeout_secs: u64,
    /// Event bus capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            recursion_limit: default_recursion_limit(),
            run_timeout_secs: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

impl RuntimeConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }
}

fn default_backend() -> String { "local".to_string() }
fn default_recursion_limit() -> usize { 100 }
fn default_event_capacity() -> usize { 1024 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Graph-level primitives (`spawn_run`, `spawn_group`, `join` nodes).
    #[serde(default = "default_true")]
    pub graph_primitives_enabled: bool,
    /// Kernel runtime operations, gated independently.
    #[serde(default = "default_true")]
    pub kernel_enabled: bool,
    /// Upper bound between status re-checks while joining.
    #[serde(default = "default_join_poll_interval")]
    pub join_poll_interval_ms: u64,
    #[serde(default)]
    pub pending_member_policy: PendingMemberPolicy,
    /// Used when no per-orchestrator policy row exists.
    #[serde(default)]
    pub default_policy: OrchestratorPolicy,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            graph_primitives_enabled: true,
            kernel_enabled: true,
            join_poll_interval_ms: default_join_poll_interval(),
            pending_member_policy: PendingMemberPolicy::default(),
            default_policy: OrchestratorPolicy::default(),
        }
    }
}

impl OrchestrationConfig {
    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms.max(1))
    }
}

fn default_true() -> bool { true }
fn default_join_poll_interval() -> u64 { 250 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Keep everything in memory (tests, dry runs).
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            in_memory: false,
        }
    }
}

impl StorageConfig {
    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        let path = &self.database_path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

fn default_database_path() -> String { "~/.strand/strand.db".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::FailurePolicy;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STRAND_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STRAND_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STRAND_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STRAND_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STRAND_VAR}\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.runtime.backend, "local");
        assert_eq!(config.runtime.recursion_limit, 100);
        assert!(config.runtime.run_timeout().is_none());
        assert!(config.orchestration.graph_primitives_enabled);
        assert!(config.orchestration.kernel_enabled);
        assert_eq!(config.orchestration.pending_member_policy, PendingMemberPolicy::Cancel);
        assert_eq!(config.orchestration.default_policy.max_depth, 3);
    }

    #[test]
    fn test_orchestration_section() {
        let config = AppConfig::parse(
            r#"
[orchestration]
kernel_enabled = false
pending_member_policy = "detach"
join_poll_interval_ms = 20

[orchestration.default_policy]
max_depth = 1
max_fanout = 4
default_failure_policy = "best_effort"
allowed_scope_subset = ["docs:read"]
"#,
        )
        .unwrap();
        let orch = config.orchestration;
        assert!(orch.graph_primitives_enabled);
        assert!(!orch.kernel_enabled);
        assert_eq!(orch.pending_member_policy, PendingMemberPolicy::Detach);
        assert_eq!(orch.join_poll_interval(), Duration::from_millis(20));
        assert_eq!(orch.default_policy.max_fanout, 4);
        assert_eq!(orch.default_policy.default_failure_policy, FailurePolicy::BestEffort);
        assert_eq!(
            orch.default_policy.allowed_scope_subset,
            Some(vec!["docs:read".to_string()])
        );
    }

    #[test]
    fn test_invalid_config_is_config_error() {
        let err = AppConfig::parse("[runtime]\nrecursion_limit = \"lots\"").unwrap_err();
        assert!(matches!(err, StrandError::Config(_)));
    }

    #[test]
    fn test_database_path_expands_home() {
        std::env::set_var("HOME", "/home/tester");
        let storage = StorageConfig::default();
        assert_eq!(
            storage.database_path(),
            PathBuf::from("/home/tester/.strand/strand.db")
        );
    }
}
