//! In-process graph runtime.
//!
//! Walks the IR in supersteps: every ready node runs concurrently against
//! the same state snapshot, then updates merge in frontier order and the
//! next frontier is computed from routing maps and plain edges. Re-join
//! nodes of a `parallel` fan-out are held until every branch has arrived.
//! State is checkpointed per thread after each superstep, which is what
//! pause/resume and `get_state` read.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use strand_core::error::{Result, StrandError};
use strand_core::state::{LOOP_COUNTERS_KEY, NODE_OUTPUTS_KEY, OUTPUT_KEY};
use strand_core::traits::NodeExecutor;
use strand_core::{
    EventEmitter, EventKind, GraphState, NodeContext, NodeOutput, RuntimeEvent, StateUpdate,
};
use strand_graph::{GraphIr, GraphIrNode};
use strand_nodes::NodeRegistry;

use crate::adapter::{
    error_kind, EventStream, Executable, RunConfig, RuntimeAdapter, StateSnapshot, StreamMode,
};

const BACKEND: &str = "local";

/// IR plus executors resolved once at compile time.
struct CompiledGraph {
    ir: GraphIr,
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
    index: HashMap<String, usize>,
}

impl CompiledGraph {
    fn node(&self, id: &str) -> Result<(&GraphIrNode, &Arc<dyn NodeExecutor>)> {
        let missing = || StrandError::Runtime(format!("node '{}' is not in the graph", id));
        let node = self
            .index
            .get(id)
            .map(|&i| &self.ir.nodes[i])
            .ok_or_else(missing)?;
        let executor = self.executors.get(id).ok_or_else(missing)?;
        Ok((node, executor))
    }

    /// Targets to activate after `id` ran and picked `handle`.
    fn successors(&self, id: &str, handle: Option<&str>) -> Vec<String> {
        match self.ir.routing(id) {
            Some(map) => match map.target(handle) {
                Some(target) => vec![target.to_string()],
                None => {
                    warn!(node_id = %id, handle = ?handle, "No route for handle, branch ends");
                    Vec::new()
                }
            },
            None => self.ir.outgoing(id).map(|e| e.target.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Checkpoint {
    state: GraphState,
    next: Vec<String>,
    /// Barrier arrivals so far, per held node.
    held: BTreeMap<String, usize>,
    interrupted: Option<String>,
    step: u64,
}

type Checkpoints = Arc<Mutex<HashMap<String, Checkpoint>>>;

/// The default runtime backend. Runs graphs inside the current process.
pub struct LocalRuntime {
    nodes: Arc<NodeRegistry>,
    checkpoints: Checkpoints,
}

impl LocalRuntime {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        Self {
            nodes,
            checkpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Threads with a live checkpoint.
    pub fn checkpointed(&self) -> usize {
        self.checkpoints.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl RuntimeAdapter for LocalRuntime {
    fn name(&self) -> &str {
        BACKEND
    }

    fn compile(&self, ir: &GraphIr) -> Result<Executable> {
        let mut executors = HashMap::with_capacity(ir.nodes.len());
        let mut index = HashMap::with_capacity(ir.nodes.len());
        for (i, node) in ir.nodes.iter().enumerate() {
            executors.insert(node.id.clone(), self.nodes.resolve(&node.node_type)?);
            index.insert(node.id.clone(), i);
        }
        let graph = CompiledGraph {
            ir: ir.clone(),
            executors,
            index,
        };
        Ok(Executable::new(BACKEND, Arc::new(graph)))
    }

    fn stream(&self, executable: &Executable, input: Value, config: RunConfig) -> EventStream {
        let graph = match executable.downcast::<Arc<CompiledGraph>>() {
            Ok(graph) => graph.clone(),
            Err(err) => {
                let event = RuntimeEvent::new(EventKind::Error, config.run_id.clone(), "graph")
                    .with_data(json!({"kind": error_kind(&err), "message": err.to_string()}));
                return stream::once(async move { event }).boxed();
            }
        };

        let (emitter, rx) = EventEmitter::channel();
        let walker = Walker {
            graph,
            config,
            emitter,
            checkpoints: self.checkpoints.clone(),
        };
        let drive: BoxFuture<'static, ()> = Box::pin(walker.drive(input));
        forward(drive, rx)
    }

    fn get_state<'a>(
        &'a self,
        executable: &'a Executable,
        config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<StateSnapshot>> {
        Box::pin(async move {
            executable.downcast::<Arc<CompiledGraph>>()?;
            let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
            let cp = checkpoints.get(&config.thread_id).ok_or_else(|| {
                StrandError::RunNotFound(format!("no checkpoint for thread {}", config.thread_id))
            })?;
            Ok(StateSnapshot {
                next: cp.next.clone(),
                values: cp.state.clone().into_value(),
            })
        })
    }

    fn release(&self, thread_id: &str) {
        let dropped = self
            .checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id)
            .is_some();
        if dropped {
            debug!(thread_id, "Dropped checkpoint");
        }
    }
}

/// Yield emitted events while `drive` runs, then drain what is left.
/// The stream ends once the walker and every emitter clone are gone.
fn forward(drive: BoxFuture<'static, ()>, rx: mpsc::UnboundedReceiver<RuntimeEvent>) -> EventStream {
    stream::unfold((Some(drive), rx), |(mut drive, mut rx)| async move {
        loop {
            let Some(running) = drive.as_mut() else {
                return rx.recv().await.map(|e| (e, (None, rx)));
            };
            tokio::select! {
                biased;
                event = rx.recv() => return event.map(|e| (e, (drive, rx))),
                _ = running => {}
            }
            drive = None;
        }
    })
    .boxed()
}

fn span_id(node_id: &str, step: u64) -> String {
    format!("{}#{}", node_id, step)
}

/// State minus the bookkeeping maps, for events and recorded outputs.
fn visible(values: &Map<String, Value>) -> Value {
    Value::Object(
        values
            .iter()
            .filter(|(k, _)| k.as_str() != LOOP_COUNTERS_KEY && k.as_str() != NODE_OUTPUTS_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn push_unique(list: &mut Vec<String>, id: String) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// One invocation of one graph.
struct Walker {
    graph: Arc<CompiledGraph>,
    config: RunConfig,
    emitter: EventEmitter,
    checkpoints: Checkpoints,
}

impl Walker {
    async fn drive(self, input: Value) {
        if let Err(err) = self.walk(input).await {
            self.fail(None, None, &err);
        }
    }

    async fn walk(&self, input: Value) -> Result<()> {
        let run_id = &self.config.run_id;
        let mut cp = match &self.config.resume_payload {
            Some(_) => self.resumable()?,
            None => Checkpoint {
                state: GraphState::with_input(input),
                next: vec![self.graph.ir.entry_point.clone()],
                ..Checkpoint::default()
            },
        };
        let mut resume_for = cp.interrupted.take().zip(self.config.resume_payload.clone());
        let mut supersteps = 0usize;

        loop {
            if self.config.cancel.is_cancelled() {
                debug!(run_id = %run_id, "Run cancelled between steps");
                self.save(&cp);
                return Ok(());
            }

            let frontier = if !cp.next.is_empty() {
                std::mem::take(&mut cp.next)
            } else if !cp.held.is_empty() {
                let mut released: Vec<String> = std::mem::take(&mut cp.held).into_keys().collect();
                released.sort_by_key(|id| self.graph.index.get(id).copied());
                debug!(run_id = %run_id, nodes = ?released, "Releasing partially joined nodes");
                released
            } else {
                break;
            };

            supersteps += 1;
            if supersteps > self.config.recursion_limit {
                return Err(StrandError::Runtime(format!(
                    "recursion limit of {} steps reached",
                    self.config.recursion_limit
                )));
            }
            cp.step += 1;
            let step = cp.step;

            let pending = frontier.iter().map(|id| {
                let payload = match &resume_for {
                    Some((node, payload)) if node == id => Some(payload.clone()),
                    _ => None,
                };
                self.execute(id, &cp.state, step, payload)
            });
            let results = tokio::select! {
                biased;
                _ = self.config.cancel.cancelled() => {
                    debug!(run_id = %run_id, step, "Run cancelled mid-step");
                    return Ok(());
                }
                results = join_all(pending) => results,
            };
            resume_for = None;

            let mut arrivals = Vec::new();
            let mut interrupted: Option<(String, Value)> = None;
            for (id, result) in frontier.iter().zip(results) {
                let span = span_id(id, step);
                let output = match result {
                    Ok(output) => output,
                    Err(err) => {
                        self.save(&cp);
                        self.fail(Some(id), Some(span), &err);
                        return Ok(());
                    }
                };
                let NodeOutput {
                    update,
                    handle,
                    interrupt,
                } = output;

                if let Some(payload) = interrupt {
                    self.emit(
                        RuntimeEvent::new(EventKind::NodeEnd, run_id.clone(), id.as_str())
                            .with_span(span)
                            .with_data(json!({"interrupted": true})),
                    );
                    match interrupted {
                        None => interrupted = Some((id.clone(), payload)),
                        Some(_) => arrivals.push(id.clone()),
                    }
                    continue;
                }

                self.apply(&mut cp.state, id, update, handle.as_deref(), span);
                for target in self.graph.successors(id, handle.as_deref()) {
                    if self.graph.ir.is_reentry(id, &target) {
                        let iteration = cp.state.increment_loop_counter(&target);
                        debug!(node_id = %target, iteration, "Loop re-entry");
                    }
                    arrivals.push(target);
                }
            }

            let mut next = Vec::new();
            for target in arrivals {
                let needed = self.graph.ir.barrier_arrivals(&target);
                if needed == 0 {
                    push_unique(&mut next, target);
                    continue;
                }
                let count = cp.held.entry(target.clone()).or_insert(0);
                *count += 1;
                if *count >= needed {
                    cp.held.remove(&target);
                    push_unique(&mut next, target);
                }
            }

            if let Some((node_id, payload)) = interrupted {
                next.retain(|id| id != &node_id);
                next.insert(0, node_id.clone());
                cp.next = next;
                cp.interrupted = Some(node_id.clone());
                self.save(&cp);
                info!(run_id = %run_id, node_id = %node_id, "Run paused for input");
                self.emit(
                    RuntimeEvent::new(EventKind::Interrupt, run_id.clone(), node_id.as_str())
                        .with_data(json!({"node_id": node_id, "payload": payload})),
                );
                return Ok(());
            }

            cp.next = next;
            self.save(&cp);
        }

        let output = cp.state.get(OUTPUT_KEY).cloned().unwrap_or(Value::Null);
        self.save(&cp);
        debug!(run_id = %run_id, steps = cp.step, "Graph finished");
        self.emit(
            RuntimeEvent::new(EventKind::RunEnd, run_id.clone(), "graph")
                .with_data(json!({"output": output, "steps": cp.step})),
        );
        Ok(())
    }

    async fn execute(
        &self,
        node_id: &str,
        state: &GraphState,
        step: u64,
        resume_payload: Option<Value>,
    ) -> Result<NodeOutput> {
        let (node, executor) = self.graph.node(node_id)?;
        let services = &self.config.services;
        info!(
            run_id = %self.config.run_id,
            node_id = %node.id,
            node_type = %node.node_type,
            "Executing graph node"
        );

        self.emit(
            RuntimeEvent::new(EventKind::NodeStart, self.config.run_id.clone(), node.id.as_str())
                .with_span(span_id(node_id, step))
                .with_data(json!({"inputs": visible(state.values())}))
                .with_metadata(json!({"node_type": node.node_type, "step": step})),
        );

        let ctx = NodeContext {
            run_id: self.config.run_id.clone(),
            tenant_id: services.tenant_id.clone(),
            agent_id: services.agent_id.clone(),
            node_id: node.id.clone(),
            span_id: span_id(node_id, step),
            auth: services.auth.clone(),
            emitter: self.emitter.clone(),
            orchestrator: services.orchestrator.clone(),
            capabilities: services.capabilities.clone(),
            resume_payload,
            cancel: self.config.cancel.child_token(),
        };
        executor.execute(state, &node.config, &ctx).await
    }

    /// Merge one node's update and report it.
    fn apply(
        &self,
        state: &mut GraphState,
        node_id: &str,
        update: StateUpdate,
        handle: Option<&str>,
        span: String,
    ) {
        let recorded = visible(&update);
        state.merge(update);
        state.record_node_output(node_id, recorded.clone());

        let mut data = json!({"outputs": recorded, "handle": handle});
        if self.config.mode == StreamMode::Values {
            data["state"] = visible(state.values());
        }
        self.emit(
            RuntimeEvent::new(EventKind::NodeEnd, self.config.run_id.clone(), node_id)
                .with_span(span)
                .with_data(data),
        );
    }

    fn resumable(&self) -> Result<Checkpoint> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let cp = checkpoints.get(&self.config.thread_id).ok_or_else(|| {
            StrandError::InvalidState(format!(
                "thread {} has no checkpoint to resume",
                self.config.thread_id
            ))
        })?;
        if cp.interrupted.is_none() {
            return Err(StrandError::InvalidState(format!(
                "thread {} is not paused",
                self.config.thread_id
            )));
        }
        Ok(cp.clone())
    }

    fn save(&self, cp: &Checkpoint) {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.config.thread_id.clone(), cp.clone());
    }

    fn emit(&self, event: RuntimeEvent) {
        if !self.emitter.emit(event) {
            debug!(run_id = %self.config.run_id, "Event stream closed, dropping event");
        }
    }

    fn fail(&self, node_id: Option<&str>, span: Option<String>, err: &StrandError) {
        warn!(run_id = %self.config.run_id, node_id = ?node_id, error = %err, "Graph run failed");
        let mut data = json!({
            "node_id": node_id,
            "kind": error_kind(err),
            "message": err.to_string(),
        });
        if let StrandError::Timeout { timeout_secs, .. } = err {
            data["timeout_secs"] = json!(timeout_secs);
        }
        let mut event =
            RuntimeEvent::new(EventKind::Error, self.config.run_id.clone(), node_id.unwrap_or("graph"))
                .with_data(data);
        if let Some(span) = span {
            event = event.with_span(span);
        }
        if let Some(node_id) = node_id {
            event = event.with_parents(vec![node_id.to_string()]);
        }
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use strand_core::RunId;
    use strand_graph::GraphCompiler;
    use strand_nodes::BuiltinOptions;
    use strand_test_utils::fixtures::{self, document, edge, node};
    use strand_test_utils::ScriptedCapabilities;

    use crate::adapter::{RunOutcome, RunServices};

    fn setup(doc: Value) -> (LocalRuntime, Executable) {
        let nodes = Arc::new(NodeRegistry::with_builtins(BuiltinOptions::default()));
        let ir = GraphCompiler::new(nodes.clone())
            .compile_value(doc)
            .unwrap()
            .into_result()
            .unwrap();
        let runtime = LocalRuntime::new(nodes);
        let exe = runtime.compile(&ir).unwrap();
        (runtime, exe)
    }

    fn config() -> RunConfig {
        RunConfig::new(RunId::new())
    }

    #[tokio::test]
    async fn diamond_takes_matching_branch() {
        let (rt, exe) = setup(fixtures::diamond());
        let cfg = config();

        let outcome = rt.run(&exe, json!("yes please"), cfg.clone()).await.unwrap();
        let RunOutcome::Completed(output) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output["branch"], "left");

        let snapshot = rt.get_state(&exe, &cfg).await.unwrap();
        assert!(snapshot.next.is_empty());
        assert_eq!(snapshot.values["node_outputs"]["left"]["branch"], "left");
        assert!(snapshot.values["node_outputs"].get("right").is_none());
    }

    #[tokio::test]
    async fn while_loop_runs_body_exactly_max_times() {
        let (rt, exe) = setup(fixtures::counting_loop(3));
        let cfg = config();

        let events: Vec<RuntimeEvent> = rt.stream(&exe, json!(null), cfg.clone()).collect().await;
        let body_runs = events
            .iter()
            .filter(|e| e.event == EventKind::NodeStart && e.name == "body")
            .count();
        assert_eq!(body_runs, 3);

        let end = events.last().unwrap();
        assert_eq!(end.event, EventKind::RunEnd);
        assert_eq!(end.data["output"], json!({"iterations": 3}));

        // Exiting clears the counter.
        let snapshot = rt.get_state(&exe, &cfg).await.unwrap();
        assert!(snapshot.values["loop_counters"].get("loop").is_none());
    }

    #[tokio::test]
    async fn parallel_branches_meet_before_merge() {
        let (rt, exe) = setup(fixtures::fan_out());
        let events: Vec<RuntimeEvent> = rt.stream(&exe, json!(null), config()).collect().await;

        let starts: Vec<&str> = events
            .iter()
            .filter(|e| e.event == EventKind::NodeStart)
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(starts, vec!["start", "fan", "a", "b", "merge", "end"]);
        assert_eq!(events.last().unwrap().data["output"], json!(3));
    }

    #[tokio::test]
    async fn uneven_branches_still_join_once() {
        // `fan -> a -> a2 -> merge` and `fan -> b -> merge`.
        let doc = document(
            vec![
                node("start", "start", json!({})),
                node("fan", "parallel", json!({})),
                node("a", "set_state", json!({"values": {"a": 1}})),
                node("a2", "set_state", json!({"values": {"a": "a + 10"}})),
                node("b", "set_state", json!({"values": {"b": 2}})),
                node("merge", "transform", json!({"mappings": {"sum": "a + b"}})),
                node("end", "end", json!({"output": "sum"})),
            ],
            vec![
                edge("start", "fan"),
                edge("fan", "a"),
                edge("fan", "b"),
                edge("a", "a2"),
                edge("a2", "merge"),
                edge("b", "merge"),
                edge("merge", "end"),
            ],
        );
        let (rt, exe) = setup(doc);
        let events: Vec<RuntimeEvent> = rt.stream(&exe, json!(null), config()).collect().await;

        let merges = events
            .iter()
            .filter(|e| e.event == EventKind::NodeStart && e.name == "merge")
            .count();
        assert_eq!(merges, 1);
        assert_eq!(events.last().unwrap().data["output"], json!(13));
    }

    #[tokio::test]
    async fn approval_pauses_and_resumes() {
        let (rt, exe) = setup(fixtures::approval_gate());
        let cfg = config();

        let first = rt.run(&exe, json!("v2"), cfg.clone()).await.unwrap();
        match first {
            RunOutcome::Interrupted { node_id, payload } => {
                assert_eq!(node_id, "gate");
                assert_eq!(payload["prompt"], "Ship v2?");
            }
            other => panic!("expected interrupt, got {:?}", other),
        }
        assert_eq!(rt.get_state(&exe, &cfg).await.unwrap().next, vec!["gate"]);

        let resumed = rt
            .run(&exe, Value::Null, cfg.clone().with_resume(json!({"approved": true})))
            .await
            .unwrap();
        assert_eq!(resumed, RunOutcome::Completed(json!("shipped")));
    }

    #[tokio::test]
    async fn release_drops_the_checkpoint() {
        let (rt, exe) = setup(fixtures::passthrough());
        let cfg = config();
        rt.run(&exe, json!("hi"), cfg.clone()).await.unwrap();
        assert_eq!(rt.checkpointed(), 1);

        rt.release(&cfg.thread_id);
        assert_eq!(rt.checkpointed(), 0);
        assert!(rt.get_state(&exe, &cfg).await.is_err());
        // Releasing twice is harmless.
        rt.release(&cfg.thread_id);
    }

    #[tokio::test]
    async fn resume_requires_a_paused_thread() {
        let (rt, exe) = setup(fixtures::passthrough());
        let err = rt
            .run(&exe, Value::Null, config().with_resume(json!(true)))
            .await
            .unwrap_err();
        assert!(matches!(err, StrandError::InvalidState(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn node_failure_ends_stream_with_error() {
        let (rt, exe) = setup(fixtures::single_tool("explode"));
        let caps = Arc::new(ScriptedCapabilities::new());
        caps.set_failing_tool("explode", "kaboom");
        let cfg = config().with_services(RunServices {
            capabilities: Some(caps),
            ..RunServices::default()
        });

        let events: Vec<RuntimeEvent> = rt.stream(&exe, json!("x"), cfg).collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.event, EventKind::Error);
        assert_eq!(last.name, "work");
        assert_eq!(last.span_id.as_deref(), Some("work#2"));
        assert!(last.data["message"].as_str().unwrap().contains("kaboom"));
        assert!(!events.iter().any(|e| e.event == EventKind::RunEnd));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_stream() {
        let (rt, exe) = setup(fixtures::single_tool("slow"));
        let caps = Arc::new(ScriptedCapabilities::new());
        caps.set_slow_tool("slow", Duration::from_secs(60));
        let cfg = config().with_services(RunServices {
            capabilities: Some(caps),
            ..RunServices::default()
        });

        let cancel = cfg.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let events: Vec<RuntimeEvent> = rt.stream(&exe, json!("x"), cfg).collect().await;
        assert!(events.iter().any(|e| e.name == "work" && e.event == EventKind::NodeStart));
        assert!(!events.iter().any(|e| e.event == EventKind::RunEnd));
        assert!(!events
            .iter()
            .any(|e| e.event == EventKind::NodeEnd && e.name == "work"));
    }

    #[tokio::test]
    async fn recursion_limit_is_enforced() {
        let (rt, exe) = setup(fixtures::counting_loop(1_000));
        let err = rt
            .run(&exe, json!(null), config().with_recursion_limit(10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("recursion limit"));
    }

    #[tokio::test]
    async fn values_mode_carries_state() {
        let (rt, exe) = setup(fixtures::passthrough());
        let events: Vec<RuntimeEvent> = rt
            .stream(&exe, json!("hi"), config().with_mode(StreamMode::Values))
            .collect()
            .await;
        let end = events
            .iter()
            .find(|e| e.event == EventKind::NodeEnd && e.name == "end")
            .unwrap();
        assert_eq!(end.data["state"]["output"], "hi");
        assert_eq!(end.span_id.as_deref(), Some("end#2"));
    }
}
