//! Run lifecycle: `queued -> running -> {completed, failed, cancelled, paused}`,
//! with `paused -> running` only through an authorized resume.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::futures::Notified;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strand_core::config::RuntimeConfig;
use strand_core::error::{Result, StrandError};
use strand_core::event::RunEvents;
use strand_core::traits::{CapabilityClient, Orchestrator, TokenBroker};
use strand_core::{
    AuthContext, Diagnostic, EventBus, EventKind, RunId, RunRecord, RunStatus, RuntimeEvent,
    TraceSpan,
};
use strand_graph::{GraphCompiler, GraphDocument};
use strand_runtime::{AdapterRegistry, RunConfig, RunServices, StateSnapshot};

use crate::catalog::{AgentCatalog, AgentDefinition, DeployedAgent};
use crate::store::RunStore;
use crate::trace::TraceRecorder;

/// A request to start a top-level run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRun {
    pub tenant_id: String,
    pub agent_id: String,
    pub user_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub grant_id: Option<String>,
    #[serde(default)]
    pub principal_id: Option<String>,
    /// Scopes the grant delegates to this run.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StartRun {
    pub fn new(
        tenant_id: impl Into<String>,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            input,
            grant_id: None,
            principal_id: None,
            scopes: vec![],
        }
    }

    pub fn with_grant(
        mut self,
        grant_id: impl Into<String>,
        principal_id: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        self.grant_id = Some(grant_id.into());
        self.principal_id = Some(principal_id.into());
        self.scopes = scopes;
        self
    }
}

/// Who is asking. Resume is only allowed for the run's own tenant and user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub tenant_id: String,
    pub user_id: String,
}

impl Caller {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// How one invocation of a run ended.
enum Ending {
    Completed(Value),
    Paused,
    Failed(String),
    Cancelled,
}

/// Owns run records: creates them, drives them through the runtime
/// adapter, persists their trace spans and broadcasts their events.
pub struct ExecutionService {
    runs: RunStore,
    traces: TraceRecorder,
    catalog: Arc<AgentCatalog>,
    compiler: GraphCompiler,
    adapters: Arc<AdapterRegistry>,
    bus: Arc<EventBus>,
    config: RuntimeConfig,
    capabilities: Option<Arc<dyn CapabilityClient>>,
    broker: Option<Arc<dyn TokenBroker>>,
    orchestrator: OnceLock<Weak<dyn Orchestrator>>,
    /// Cancellation tokens of invocations currently being driven, tagged
    /// with the launch that owns them.
    active: Mutex<HashMap<RunId, (u64, CancellationToken)>>,
    launches: AtomicU64,
    status: Notify,
}

impl ExecutionService {
    pub fn new(
        runs: RunStore,
        catalog: Arc<AgentCatalog>,
        compiler: GraphCompiler,
        adapters: Arc<AdapterRegistry>,
        bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            traces: TraceRecorder::new(runs.clone()),
            runs,
            catalog,
            compiler,
            adapters,
            bus,
            config,
            capabilities: None,
            broker: None,
            orchestrator: OnceLock::new(),
            active: Mutex::new(HashMap::new()),
            launches: AtomicU64::new(0),
            status: Notify::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Arc<dyn CapabilityClient>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_token_broker(mut self, broker: Arc<dyn TokenBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Hand node executors an orchestrator. Only the first call takes effect.
    pub fn attach_orchestrator(&self, orchestrator: Weak<dyn Orchestrator>) {
        if self.orchestrator.set(orchestrator).is_err() {
            warn!("Orchestrator already attached, ignoring");
        }
    }

    pub fn catalog(&self) -> &Arc<AgentCatalog> {
        &self.catalog
    }

    // ── Agents ───────────────────────────────────────────────────

    /// Compile `document` and register it under `definition`. Error
    /// diagnostics reject the deploy; warnings are returned.
    pub fn deploy_agent(
        &self,
        definition: AgentDefinition,
        document: &GraphDocument,
    ) -> Result<(Arc<DeployedAgent>, Vec<Diagnostic>)> {
        let output = self.compiler.compile(document);
        let warnings: Vec<Diagnostic> = output.warnings().cloned().collect();
        let ir = output.into_result()?;
        let adapter = match &definition.backend {
            Some(name) => self.adapters.resolve(name)?,
            None => self.adapters.default_adapter(),
        };
        let executable = adapter.compile(&ir)?;
        let agent = self.catalog.register(DeployedAgent {
            definition,
            ir: Arc::new(ir),
            executable,
            backend: adapter.name().to_string(),
        });
        Ok((agent, warnings))
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Create a queued run and start driving it in the background.
    pub fn start_run(self: &Arc<Self>, req: StartRun) -> Result<RunRecord> {
        let agent = self.catalog.get(&req.tenant_id, &req.agent_id).ok_or_else(|| {
            StrandError::Resolution(format!(
                "agent '{}' not found in tenant '{}'",
                req.agent_id, req.tenant_id
            ))
        })?;
        let mut run = RunRecord::top_level(req.tenant_id, req.agent_id, req.user_id, req.input);
        run.grant_id = req.grant_id;
        run.principal_id = req.principal_id;
        run.delegated_scopes = req.scopes;
        self.runs.insert(&run)?;
        info!(run_id = %run.id, agent_id = %run.agent_id, tenant_id = %run.tenant_id, "Run queued");
        self.launch(run.clone(), agent, None);
        Ok(run)
    }

    /// Persist and start a child run prepared by the orchestration kernel.
    pub(crate) fn start_child(
        self: &Arc<Self>,
        run: RunRecord,
        agent: Arc<DeployedAgent>,
    ) -> Result<RunRecord> {
        self.runs.insert(&run)?;
        info!(
            run_id = %run.id,
            parent_run_id = ?run.parent_run_id.as_ref().map(|p| p.as_str()),
            agent_id = %run.agent_id,
            depth = run.depth,
            "Child run queued"
        );
        self.launch(run.clone(), agent, None);
        Ok(run)
    }

    /// Continue a paused run with `payload` as the resume command.
    pub fn resume_run(
        self: &Arc<Self>,
        run_id: &RunId,
        caller: &Caller,
        payload: Value,
    ) -> Result<RunRecord> {
        let run = self.get_run(run_id)?;
        if run.tenant_id != caller.tenant_id || run.user_id != caller.user_id {
            warn!(run_id = %run_id, tenant_id = %caller.tenant_id, "Resume by non-owner rejected");
            return Err(StrandError::Permission(format!(
                "run {} does not belong to the caller",
                run_id
            )));
        }
        if run.status != RunStatus::Paused {
            return Err(StrandError::InvalidState(format!(
                "run {} is {}, only paused runs can be resumed",
                run_id,
                run.status.as_str()
            )));
        }
        let agent = self.catalog.get(&run.tenant_id, &run.agent_id).ok_or_else(|| {
            StrandError::Resolution(format!("agent '{}' is no longer deployed", run.agent_id))
        })?;
        if !self.runs.mark_running(run_id, RunStatus::Paused)? {
            return Err(StrandError::InvalidState(format!(
                "run {} was resumed concurrently",
                run_id
            )));
        }
        self.status.notify_waiters();
        info!(run_id = %run_id, "Run resumed");
        self.launch(run.clone(), agent, Some(payload));
        self.get_run(run_id)
    }

    /// Cancel an active run. Returns false when it had already settled.
    pub fn cancel_run(&self, run_id: &RunId, reason: &str) -> Result<bool> {
        let cancelled = self.runs.cancel(run_id, reason)?;
        let token = self.active_token(run_id);
        if let Some(token) = &token {
            token.cancel();
        }
        if cancelled {
            info!(run_id = %run_id, reason, "Run cancelled");
            self.status.notify_waiters();
            if let Some(run) = self.runs.get(run_id)? {
                // Nothing is driving a paused run, so its checkpoint is ours to drop.
                if token.is_none() {
                    self.discard_checkpoint(&run);
                }
                self.child_lifecycle(&run);
            }
        }
        Ok(cancelled)
    }

    fn launch(self: &Arc<Self>, run: RunRecord, agent: Arc<DeployedAgent>, resume: Option<Value>) {
        let launch = self.launches.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run.id.clone(), (launch, cancel.clone()));
        let service = self.clone();
        tokio::spawn(async move { service.drive(run, agent, resume, launch, cancel).await });
    }

    async fn drive(
        self: Arc<Self>,
        run: RunRecord,
        agent: Arc<DeployedAgent>,
        resume: Option<Value>,
        launch: u64,
        cancel: CancellationToken,
    ) {
        let run_id = run.id.clone();
        let adapter = match self.adapters.resolve(&agent.backend) {
            Ok(adapter) => adapter,
            Err(e) => {
                let message = e.to_string();
                self.release(&run_id, launch);
                let written = match resume {
                    None => self.runs.fail_queued(&run_id, &message),
                    Some(_) => self.runs.finish(&run_id, RunStatus::Failed, None, Some(message.as_str())),
                };
                self.settled(&run_id, &Ending::Failed(message), written);
                return;
            }
        };

        if resume.is_none() {
            match self.runs.mark_running(&run_id, RunStatus::Queued) {
                Ok(true) => self.status.notify_waiters(),
                Ok(false) => {
                    debug!(run_id = %run_id, "Run left the queue before starting");
                    self.release(&run_id, launch);
                    return;
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Failed to start run");
                    self.release(&run_id, launch);
                    return;
                }
            }
        }

        let mut config = RunConfig::new(run_id.clone())
            .with_recursion_limit(self.config.recursion_limit)
            .with_cancel(cancel.clone())
            .with_services(self.services_for(&run));
        if let Some(payload) = resume {
            config = config.with_resume(payload);
        }
        let events = adapter.stream(&agent.executable, run.input_params.clone(), config);
        let ending = match AssertUnwindSafe(self.consume(&run_id, events, &cancel))
            .catch_unwind()
            .await
        {
            Ok(ending) => ending,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(run_id = %run_id, panic = %message, "Run panicked");
                cancel.cancel();
                Ending::Failed(format!("run panicked: {}", message))
            }
        };

        // Leave `active` before the ending is visible: a resume that sees
        // `paused` registers its own token, which this invocation must not touch.
        self.release(&run_id, launch);
        let written = match &ending {
            Ending::Completed(output) => {
                self.runs.finish(&run_id, RunStatus::Completed, Some(output), None)
            }
            Ending::Paused => self.runs.mark_paused(&run_id),
            Ending::Failed(message) => {
                self.runs.finish(&run_id, RunStatus::Failed, None, Some(message.as_str()))
            }
            // Whoever cancelled already wrote the record.
            Ending::Cancelled => Ok(false),
        };
        // Only a run that actually paused keeps its checkpoint.
        if !matches!((&ending, &written), (Ending::Paused, Ok(true))) {
            adapter.release(run_id.as_str());
        }
        self.settled(&run_id, &ending, written);
    }

    /// Log, notify and report an ending that was (or was not) written.
    fn settled(&self, run_id: &RunId, ending: &Ending, written: Result<bool>) {
        match written {
            Ok(true) => {
                match ending {
                    Ending::Completed(_) => info!(run_id = %run_id, "Run completed"),
                    Ending::Paused => info!(run_id = %run_id, "Run paused"),
                    Ending::Failed(message) => warn!(run_id = %run_id, error = %message, "Run failed"),
                    Ending::Cancelled => {}
                }
                self.status.notify_waiters();
                if let Ok(Some(record)) = self.runs.get(run_id) {
                    self.child_lifecycle(&record);
                }
            }
            Ok(false) => debug!(run_id = %run_id, "Run settled elsewhere"),
            Err(e) => error!(run_id = %run_id, error = %e, "Failed to record run outcome"),
        }
    }

    /// Drain `events` until the invocation ends, is cancelled or times out.
    async fn consume(
        &self,
        run_id: &RunId,
        mut events: strand_runtime::EventStream,
        cancel: &CancellationToken,
    ) -> Ending {
        let limit = self.config.run_timeout();
        let timeout = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timeout);

        let mut ending = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ending::Cancelled,
                _ = &mut timeout => {
                    let secs = limit.map_or(0, |l| l.as_secs());
                    warn!(run_id = %run_id, secs, "Run timed out");
                    cancel.cancel();
                    return Ending::Failed(format!("run exceeded its timeout of {}s", secs));
                }
                next = events.next() => {
                    let Some(event) = next else { break };
                    self.observe(&event);
                    match event.event {
                        EventKind::RunEnd => {
                            let output = event.data.get("output").cloned().unwrap_or(Value::Null);
                            ending = Some(Ending::Completed(output));
                        }
                        EventKind::Interrupt => ending = Some(Ending::Paused),
                        EventKind::Error => {
                            let message = event
                                .data
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown error")
                                .to_string();
                            ending = Some(Ending::Failed(message));
                        }
                        _ => {}
                    }
                }
            }
        }
        ending.unwrap_or_else(|| Ending::Failed("event stream ended without a result".into()))
    }

    /// Persist spans and broadcast. Trace failures never stop a run.
    fn observe(&self, event: &RuntimeEvent) {
        if let Err(e) = self.traces.record(event) {
            warn!(run_id = %event.run_id, error = %e, "Failed to record trace span");
        }
        self.bus.publish(event.clone());
    }

    fn services_for(&self, run: &RunRecord) -> RunServices {
        RunServices {
            tenant_id: run.tenant_id.clone(),
            agent_id: run.agent_id.clone(),
            auth: AuthContext {
                grant_id: run.grant_id.clone(),
                principal_id: run.principal_id.clone(),
                initiator_user_id: run.user_id.clone(),
                run_id: run.id.clone(),
                scopes: run.delegated_scopes.clone(),
                broker: self.broker.clone(),
            },
            orchestrator: self.orchestrator.get().and_then(Weak::upgrade),
            capabilities: self.capabilities.clone(),
        }
    }

    fn active_token(&self, run_id: &RunId) -> Option<CancellationToken> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .map(|(_, token)| token.clone())
    }

    /// Drop the token registered by `launch`. A newer launch's token stays.
    fn release(&self, run_id: &RunId, launch: u64) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.get(run_id).is_some_and(|(owner, _)| *owner == launch) {
            active.remove(run_id);
        }
    }

    fn discard_checkpoint(&self, run: &RunRecord) {
        let Some(agent) = self.catalog.get(&run.tenant_id, &run.agent_id) else {
            return;
        };
        if let Some(adapter) = self.adapters.get(&agent.backend) {
            adapter.release(run.id.as_str());
        }
    }

    /// Tell the parent's listeners that a child settled.
    fn child_lifecycle(&self, run: &RunRecord) {
        let Some(parent) = &run.parent_run_id else {
            return;
        };
        if !run.status.is_terminal() {
            return;
        }
        self.bus.publish(
            RuntimeEvent::new(EventKind::ChildLifecycle, parent.clone(), run.id.as_str())
                .with_data(json!({
                    "child_run_id": run.id,
                    "agent_id": run.agent_id,
                    "status": run.status,
                    "group_id": run.orchestration_group_id,
                    "error": run.error_message,
                })),
        );
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get_run(&self, run_id: &RunId) -> Result<RunRecord> {
        self.runs
            .get(run_id)?
            .ok_or_else(|| StrandError::RunNotFound(run_id.to_string()))
    }

    /// Wait until the run is terminal or paused.
    pub async fn wait(&self, run_id: &RunId, timeout: Duration) -> Result<RunRecord> {
        // `None` when the wait outlives what `Instant` can represent.
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            let notified = self.status_changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let run = self.get_run(run_id)?;
            if run.status.is_terminal() || run.status == RunStatus::Paused {
                return Ok(run);
            }
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = expired => {
                    return Err(StrandError::Timeout {
                        what: format!("waiting for run {}", run_id),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            }
        }
    }

    /// Where the adapter would continue this run from.
    pub async fn snapshot(&self, run_id: &RunId) -> Result<StateSnapshot> {
        let run = self.get_run(run_id)?;
        let agent = self.catalog.get(&run.tenant_id, &run.agent_id).ok_or_else(|| {
            StrandError::Resolution(format!("agent '{}' is no longer deployed", run.agent_id))
        })?;
        let adapter = self.adapters.resolve(&agent.backend)?;
        let config = RunConfig::new(run_id.clone());
        adapter.get_state(&agent.executable, &config).await
    }

    pub fn spans(&self, run_id: &RunId) -> Result<Vec<TraceSpan>> {
        self.runs.spans(run_id)
    }

    pub fn children(&self, parent: &RunId) -> Result<Vec<RunRecord>> {
        self.runs.children(parent)
    }

    pub fn count_children(&self, parent: &RunId) -> Result<u32> {
        self.runs.count_children(parent)
    }

    /// All runs sharing `root`, shallowest first.
    pub fn tree_runs(&self, root: &RunId) -> Result<Vec<RunRecord>> {
        self.runs.tree(root)
    }

    /// Fires whenever any run changes status. Call `enable()` on the
    /// future before checking state to avoid missing a wakeup.
    pub fn status_changed(&self) -> Notified<'_> {
        self.status.notified()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_run(&self, run_id: RunId) -> RunEvents {
        self.bus.subscribe_run(run_id)
    }

    pub(crate) fn publish(&self, event: RuntimeEvent) {
        self.bus.publish(event);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::traits::{CompletionRequest, RetrievalRequest, ToolCall};
    use strand_nodes::{BuiltinOptions, NodeRegistry};
    use strand_runtime::LocalRuntime;
    use strand_test_utils::fixtures::{branch, document, edge, node};
    use strand_test_utils::{fixtures, ScriptedCapabilities};

    use crate::db::Database;

    const WAIT: Duration = Duration::from_secs(5);

    fn harness(capabilities: Arc<dyn CapabilityClient>) -> (Arc<ExecutionService>, Arc<LocalRuntime>) {
        let nodes = Arc::new(NodeRegistry::with_builtins(BuiltinOptions::default()));
        let local = Arc::new(LocalRuntime::new(nodes.clone()));
        let service = ExecutionService::new(
            RunStore::new(Arc::new(Database::in_memory().unwrap())),
            Arc::new(AgentCatalog::new()),
            GraphCompiler::new(nodes),
            Arc::new(AdapterRegistry::new(local.clone())),
            Arc::new(EventBus::default()),
            RuntimeConfig::default(),
        )
        .with_capabilities(capabilities);
        (Arc::new(service), local)
    }

    fn service(capabilities: Arc<ScriptedCapabilities>) -> Arc<ExecutionService> {
        harness(capabilities).0
    }

    /// Every tool call panics.
    struct PanickingTools;

    impl CapabilityClient for PanickingTools {
        fn complete(&self, _req: CompletionRequest) -> futures::future::BoxFuture<'_, Result<String>> {
            Box::pin(async { Ok(String::new()) })
        }

        fn call_tool(&self, call: ToolCall) -> futures::future::BoxFuture<'_, Result<Value>> {
            Box::pin(async move { panic!("tool {} blew up", call.tool_id) })
        }

        fn retrieve(
            &self,
            _req: RetrievalRequest,
        ) -> futures::future::BoxFuture<'_, Result<Vec<Value>>> {
            Box::pin(async { Ok(vec![]) })
        }
    }

    /// `start -> gate -> {approved: work (slow tool), rejected: end}`.
    fn gated_slow_tool() -> Value {
        document(
            vec![
                node("start", "start", json!({})),
                node("gate", "approval", json!({"prompt": "go?"})),
                node("work", "tool", json!({"tool_id": "slow", "arguments": {}})),
                node("end", "end", json!({"output": "tool_result"})),
            ],
            vec![
                edge("start", "gate"),
                branch("gate", "work", "approved"),
                branch("gate", "end", "rejected"),
                edge("work", "end"),
            ],
        )
    }

    fn deploy(service: &ExecutionService, id: &str, doc: Value) {
        let doc = GraphDocument::from_value(doc).unwrap();
        service
            .deploy_agent(AgentDefinition::new("t1", id), &doc)
            .unwrap();
    }

    #[tokio::test]
    async fn diamond_run_completes_with_traces() {
        let service = service(Arc::new(ScriptedCapabilities::new()));
        deploy(&service, "diamond", fixtures::diamond());

        let run = service
            .start_run(StartRun::new("t1", "diamond", "u1", json!("yes please")))
            .unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        let done = service.wait(&run.id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.started_at.is_some());

        let spans = service.spans(&run.id).unwrap();
        let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["start", "route", "left", "end"]);
        assert!(spans.iter().all(|s| s.end_time.is_some()));
    }

    #[tokio::test]
    async fn failing_node_fails_the_run() {
        let caps = Arc::new(ScriptedCapabilities::new());
        caps.set_failing_tool("explode", "kaboom");
        let service = service(caps);
        deploy(&service, "failing", fixtures::single_tool("explode"));

        let run = service
            .start_run(StartRun::new("t1", "failing", "u1", json!(1)))
            .unwrap();
        let done = service.wait(&run.id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.error_message.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn resume_checks_ownership_then_continues() {
        let service = service(Arc::new(ScriptedCapabilities::new()));
        deploy(&service, "gate", fixtures::approval_gate());

        let run = service
            .start_run(StartRun::new("t1", "gate", "u1", json!("v2")))
            .unwrap();
        let paused = service.wait(&run.id, WAIT).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(service.snapshot(&run.id).await.unwrap().next[0], "gate");

        let stranger = Caller::new("t2", "u1");
        let err = service
            .resume_run(&run.id, &stranger, json!({"approved": true}))
            .unwrap_err();
        assert!(err.is_permission());

        let owner = Caller::new("t1", "u1");
        service
            .resume_run(&run.id, &owner, json!({"approved": true}))
            .unwrap();
        let done = service.wait(&run.id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output_result, Some(json!("shipped")));

        let again = service.resume_run(&run.id, &owner, json!({"approved": true}));
        assert!(matches!(again, Err(StrandError::InvalidState(_))));
    }

    #[tokio::test]
    async fn cancel_stops_an_in_flight_run() {
        let caps = Arc::new(ScriptedCapabilities::new());
        caps.set_slow_tool("slow", Duration::from_secs(30));
        let service = service(caps);
        deploy(&service, "slow", fixtures::single_tool("slow"));

        let run = service
            .start_run(StartRun::new("t1", "slow", "u1", json!(1)))
            .unwrap();
        // Let it reach the tool call.
        while service.get_run(&run.id).unwrap().status != RunStatus::Running {
            tokio::task::yield_now().await;
        }
        assert!(service.cancel_run(&run.id, "user request").unwrap());
        assert!(!service.cancel_run(&run.id, "again").unwrap());

        let done = service.wait(&run.id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
        assert_eq!(done.error_message.as_deref(), Some("user request"));
    }

    #[tokio::test]
    async fn deploy_rejects_invalid_graphs() {
        let service = service(Arc::new(ScriptedCapabilities::new()));
        let doc = GraphDocument::from_value(fixtures::document(
            vec![fixtures::node("start", "start", json!({}))],
            vec![],
        ))
        .unwrap();
        let err = service
            .deploy_agent(AgentDefinition::new("t1", "broken"), &doc)
            .err()
            .unwrap();
        assert!(matches!(err, StrandError::Validation(_)));

        let missing = service.start_run(StartRun::new("t1", "broken", "u1", json!(null)));
        assert!(matches!(missing, Err(StrandError::Resolution(_))));
    }

    #[tokio::test]
    async fn only_paused_runs_keep_a_checkpoint() {
        let caps = Arc::new(ScriptedCapabilities::new());
        caps.set_failing_tool("explode", "kaboom");
        let (service, local) = harness(caps);
        deploy(&service, "diamond", fixtures::diamond());
        deploy(&service, "failing", fixtures::single_tool("explode"));
        deploy(&service, "gate", fixtures::approval_gate());

        let done = service
            .start_run(StartRun::new("t1", "diamond", "u1", json!("yes")))
            .unwrap();
        service.wait(&done.id, WAIT).await.unwrap();
        let failed = service
            .start_run(StartRun::new("t1", "failing", "u1", json!(1)))
            .unwrap();
        service.wait(&failed.id, WAIT).await.unwrap();
        assert_eq!(local.checkpointed(), 0);

        let paused = service
            .start_run(StartRun::new("t1", "gate", "u1", json!("v2")))
            .unwrap();
        assert_eq!(service.wait(&paused.id, WAIT).await.unwrap().status, RunStatus::Paused);
        assert_eq!(local.checkpointed(), 1);

        assert!(service.cancel_run(&paused.id, "abandoned").unwrap());
        assert_eq!(local.checkpointed(), 0);
    }

    #[tokio::test]
    async fn panicking_node_fails_the_run() {
        let (service, local) = harness(Arc::new(PanickingTools));
        deploy(&service, "fragile", fixtures::single_tool("boom"));

        let run = service
            .start_run(StartRun::new("t1", "fragile", "u1", json!(1)))
            .unwrap();
        let done = service.wait(&run.id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        let message = done.error_message.unwrap();
        assert!(message.contains("run panicked"), "{}", message);
        assert!(message.contains("tool boom blew up"), "{}", message);
        assert!(service.active_token(&run.id).is_none());
        assert_eq!(local.checkpointed(), 0);
    }

    #[tokio::test]
    async fn a_stale_release_keeps_the_resumed_token() {
        let caps = Arc::new(ScriptedCapabilities::new());
        caps.set_slow_tool("slow", Duration::from_secs(30));
        let service = service(caps);
        deploy(&service, "gated", gated_slow_tool());

        let run = service
            .start_run(StartRun::new("t1", "gated", "u1", json!(null)))
            .unwrap();
        assert_eq!(service.wait(&run.id, WAIT).await.unwrap().status, RunStatus::Paused);
        service
            .resume_run(&run.id, &Caller::new("t1", "u1"), json!({"approved": true}))
            .unwrap();

        // The first invocation's launch releasing late must not drop the new token.
        service.release(&run.id, 0);
        assert!(service.active_token(&run.id).is_some());

        assert!(service.cancel_run(&run.id, "stop").unwrap());
        let done = service.wait(&run.id, WAIT).await.unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
        tokio::time::timeout(WAIT, async {
            while service.active_token(&run.id).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
