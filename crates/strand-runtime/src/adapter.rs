//! The seam between the execution service and a graph-execution backend.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{CapabilityClient, Orchestrator};
use strand_core::{AuthContext, EventKind, RunId, RuntimeEvent};
use strand_graph::GraphIr;

/// Lifecycle events of one invocation, in emission order.
pub type EventStream = BoxStream<'static, RuntimeEvent>;

/// How much state `node_end` events carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Each node's own update.
    #[default]
    Updates,
    /// The update plus the full state after it was applied.
    Values,
}

/// Collaborators handed to node executors for one invocation.
#[derive(Clone, Default)]
pub struct RunServices {
    pub tenant_id: String,
    pub agent_id: String,
    pub auth: AuthContext,
    pub orchestrator: Option<Arc<dyn Orchestrator>>,
    pub capabilities: Option<Arc<dyn CapabilityClient>>,
}

/// Per-invocation settings.
#[derive(Clone)]
pub struct RunConfig {
    /// Checkpoint key; pause/resume and `get_state` go through it.
    pub thread_id: String,
    pub run_id: RunId,
    pub mode: StreamMode,
    /// Supersteps allowed per invocation.
    pub recursion_limit: usize,
    pub resume_payload: Option<Value>,
    pub cancel: CancellationToken,
    pub services: RunServices,
}

impl RunConfig {
    pub fn new(run_id: RunId) -> Self {
        Self {
            thread_id: run_id.to_string(),
            run_id,
            mode: StreamMode::default(),
            recursion_limit: 100,
            resume_payload: None,
            cancel: CancellationToken::new(),
            services: RunServices::default(),
        }
    }

    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn with_resume(mut self, payload: Value) -> Self {
        self.resume_payload = Some(payload);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_services(mut self, services: RunServices) -> Self {
        self.services = services;
        self
    }
}

/// Where a thread's last invocation stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Nodes that run next; empty once the graph has finished.
    pub next: Vec<String>,
    pub values: Value,
}

/// How a `run` call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Value),
    Interrupted { node_id: String, payload: Value },
}

/// A backend-specific compiled graph.
#[derive(Clone)]
pub struct Executable {
    backend: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Executable {
    pub fn new<T: Any + Send + Sync>(backend: impl Into<String>, inner: T) -> Self {
        Self {
            backend: backend.into(),
            inner: Arc::new(inner),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Result<&T> {
        self.inner.downcast_ref::<T>().ok_or_else(|| {
            StrandError::Runtime(format!(
                "executable was compiled by backend '{}'",
                self.backend
            ))
        })
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable")
            .field("backend", &self.backend)
            .finish()
    }
}

/// A graph-execution backend.
///
/// `stream` must stop promptly once `config.cancel` fires, and must not
/// produce events after it ends. Dropping the stream abandons the
/// invocation.
pub trait RuntimeAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, ir: &GraphIr) -> Result<Executable>;

    fn stream(&self, executable: &Executable, input: Value, config: RunConfig) -> EventStream;

    fn get_state<'a>(
        &'a self,
        executable: &'a Executable,
        config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<StateSnapshot>>;

    /// Forget a thread that will never be resumed. Backends that keep
    /// nothing per thread can ignore this.
    fn release(&self, _thread_id: &str) {}

    /// Drive `stream` to the end and report how it finished.
    fn run<'a>(
        &'a self,
        executable: &'a Executable,
        input: Value,
        config: RunConfig,
    ) -> BoxFuture<'a, Result<RunOutcome>> {
        let mut events = self.stream(executable, input, config);
        Box::pin(async move {
            while let Some(event) = events.next().await {
                match event.event {
                    EventKind::RunEnd => {
                        let output = event.data.get("output").cloned().unwrap_or(Value::Null);
                        return Ok(RunOutcome::Completed(output));
                    }
                    EventKind::Interrupt => {
                        let payload = event.data.get("payload").cloned().unwrap_or(Value::Null);
                        return Ok(RunOutcome::Interrupted {
                            node_id: event.name,
                            payload,
                        });
                    }
                    EventKind::Error => return Err(error_from_event(&event)),
                    _ => {}
                }
            }
            Err(StrandError::Cancelled)
        })
    }
}

/// Rebuild an error from an `error` event.
pub fn error_from_event(event: &RuntimeEvent) -> StrandError {
    let message = event
        .data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    match event.data.get("kind").and_then(Value::as_str) {
        Some("permission") => StrandError::Permission(message),
        Some("resolution") => StrandError::Resolution(message),
        Some("invalid_state") => StrandError::InvalidState(message),
        Some("timeout") => StrandError::Timeout {
            what: event.name.clone(),
            timeout_secs: event
                .data
                .get("timeout_secs")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        },
        _ => StrandError::node(event.name.clone(), message),
    }
}

/// Coarse error class carried in `error` events.
pub fn error_kind(err: &StrandError) -> &'static str {
    match err {
        StrandError::Permission(_) => "permission",
        StrandError::Resolution(_) => "resolution",
        StrandError::Timeout { .. } => "timeout",
        StrandError::Expression(_) => "expression",
        StrandError::InvalidState(_) => "invalid_state",
        StrandError::Cancelled => "cancelled",
        _ => "runtime",
    }
}
