//! Document -> IR compilation and validation.
//!
//! Every check collects into one diagnostics list instead of stopping at the
//! first problem, so an editor can show them all at once. Any error withholds
//! the IR; warnings do not.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::traits::NodeExecutor;
use strand_core::Diagnostic;
use strand_nodes::NodeRegistry;

use crate::document::{DocumentEdge, DocumentNode, GraphDocument};
use crate::ir::{Barrier, GraphIr, GraphIrEdge, GraphIrNode, RoutingMap};

const PARALLEL_TYPE: &str = "parallel";
const LOOP_TYPE: &str = "while";

#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    pub orchestration_enabled: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            orchestration_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub ir: Option<GraphIr>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn is_ok(&self) -> bool {
        self.ir.is_some()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_error())
    }

    pub fn into_result(self) -> Result<GraphIr> {
        match self.ir {
            Some(ir) => Ok(ir),
            None => Err(StrandError::Validation(self.diagnostics)),
        }
    }
}

/// Validates graph documents against a node registry and lowers them to IR.
pub struct GraphCompiler {
    registry: Arc<NodeRegistry>,
    options: CompilerOptions,
}

impl GraphCompiler {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            options: CompilerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Parse and compile a JSON document. Malformed JSON is an error;
    /// everything else is reported as diagnostics.
    pub fn compile_value(&self, document: serde_json::Value) -> Result<CompileOutput> {
        let doc = GraphDocument::from_value(document)?;
        Ok(self.compile(&doc))
    }

    pub fn compile(&self, doc: &GraphDocument) -> CompileOutput {
        let mut diags = Vec::new();

        // ── Nodes ────────────────────────────────────────────────
        let mut nodes: Vec<&DocumentNode> = Vec::with_capacity(doc.nodes.len());
        let mut order: HashMap<&str, usize> = HashMap::with_capacity(doc.nodes.len());
        let mut executors: HashMap<&str, Arc<dyn NodeExecutor>> = HashMap::new();

        for (i, node) in doc.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                diags.push(Diagnostic::error(
                    format!("Node at index {} has an empty id", i),
                    None,
                ));
                continue;
            }
            if order.contains_key(node.id.as_str()) {
                diags.push(Diagnostic::error(
                    format!("Duplicate node id '{}'", node.id),
                    Some(node.id.clone()),
                ));
                continue;
            }
            order.insert(&node.id, nodes.len());
            nodes.push(node);

            let Some(executor) = self.registry.get(&node.node_type) else {
                diags.push(Diagnostic::error(
                    format!("Unknown node type '{}'", node.node_type),
                    Some(node.id.clone()),
                ));
                continue;
            };
            if executor.is_orchestration() && !self.options.orchestration_enabled {
                diags.push(Diagnostic::error(
                    format!(
                        "Node type '{}' is an orchestration primitive, which is disabled",
                        node.node_type
                    ),
                    Some(node.id.clone()),
                ));
            }
            for problem in executor.validate_config(&node.config).errors {
                diags.push(Diagnostic::error(
                    format!("{}: {}", problem.field, problem.message),
                    Some(node.id.clone()),
                ));
            }
            executors.insert(&node.id, executor);
        }

        // ── Edges ────────────────────────────────────────────────
        let mut edges: Vec<&DocumentEdge> = Vec::with_capacity(doc.edges.len());
        for edge in &doc.edges {
            let mut known = true;
            for (end, id) in [("source", &edge.source), ("target", &edge.target)] {
                if !order.contains_key(id.as_str()) {
                    diags.push(Diagnostic::error(
                        format!("Edge '{}' references unknown {} node '{}'", edge.id, end, id),
                        None,
                    ));
                    known = false;
                }
            }
            if known {
                edges.push(edge);
            }
        }

        let mut outgoing: HashMap<&str, Vec<&DocumentEdge>> = HashMap::new();
        for edge in &edges {
            outgoing.entry(edge.source.as_str()).or_default().push(edge);
        }
        let successors = |id: &str| -> Vec<&str> {
            outgoing
                .get(id)
                .map(|es| es.iter().map(|e| e.target.as_str()).collect())
                .unwrap_or_default()
        };

        // ── Entry and exits ──────────────────────────────────────
        let has_role = |node: &DocumentNode, role: fn(&dyn NodeExecutor) -> bool| {
            executors
                .get(node.id.as_str())
                .is_some_and(|e| role(e.as_ref()))
        };
        let inputs: Vec<&str> = nodes
            .iter()
            .filter(|n| has_role(n, |e| e.is_input()))
            .map(|n| n.id.as_str())
            .collect();
        let outputs: BTreeSet<String> = nodes
            .iter()
            .filter(|n| has_role(n, |e| e.is_output()))
            .map(|n| n.id.clone())
            .collect();

        if inputs.is_empty() || outputs.is_empty() {
            diags.push(Diagnostic::error(
                "Graph must have at least one input/output node",
                None,
            ));
        } else if inputs.len() > 1 {
            diags.push(Diagnostic::error(
                format!(
                    "Graph must have exactly one input node, found {}: {}",
                    inputs.len(),
                    inputs.join(", ")
                ),
                None,
            ));
        }
        let entry = (inputs.len() == 1).then(|| inputs[0]);

        // ── Routing ──────────────────────────────────────────────
        let mut routing_maps = BTreeMap::new();
        for node in &nodes {
            let Some(executor) = executors.get(node.id.as_str()) else {
                continue;
            };
            let Some(handles) = executor.output_handles(&node.config) else {
                continue;
            };
            let mut map = RoutingMap {
                edges: BTreeMap::new(),
                default_handle: executor.default_handle(&node.config),
            };
            for edge in outgoing.get(node.id.as_str()).into_iter().flatten() {
                let Some(handle) = &edge.source_handle else {
                    diags.push(Diagnostic::error(
                        format!("Edge '{}' leaves a branching node without a source_handle", edge.id),
                        Some(node.id.clone()),
                    ));
                    continue;
                };
                if !handles.contains(handle) {
                    diags.push(Diagnostic::error(
                        format!("Edge '{}' uses undeclared handle '{}'", edge.id, handle),
                        Some(node.id.clone()),
                    ));
                    continue;
                }
                if let Some(previous) = map.edges.insert(handle.clone(), edge.target.clone()) {
                    if previous != edge.target {
                        diags.push(Diagnostic::error(
                            format!("Handle '{}' is routed to more than one target", handle),
                            Some(node.id.clone()),
                        ));
                    }
                }
            }
            let missing: Vec<&str> = handles
                .iter()
                .filter(|h| !map.edges.contains_key(*h))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                diags.push(Diagnostic::error(
                    format!(
                        "Routing map for node '{}' is missing handle(s): {}",
                        node.id,
                        missing.join(", ")
                    ),
                    Some(node.id.clone()),
                ));
            }
            routing_maps.insert(node.id.clone(), map);
        }

        // ── Reachability ─────────────────────────────────────────
        let reached: HashSet<&str> = match entry {
            Some(entry) => bfs_distances(entry, None, &successors)
                .into_keys()
                .collect(),
            None => HashSet::new(),
        };
        if let Some(entry) = entry {
            for node in &nodes {
                let id = node.id.as_str();
                let inert = executors.get(id).is_some_and(|e| e.is_inert());
                if reached.contains(id) || inert {
                    continue;
                }
                let message = format!("Node '{}' is unreachable from entry '{}'", id, entry);
                if node.is_sink() {
                    diags.push(Diagnostic::warning(
                        format!("{} (marked as sink)", message),
                        Some(node.id.clone()),
                    ));
                } else {
                    diags.push(Diagnostic::error(message, Some(node.id.clone())));
                }
            }
        }

        for node in &nodes {
            let id = node.id.as_str();
            let Some(executor) = executors.get(id) else {
                continue;
            };
            let targets: BTreeSet<&str> = successors(id).into_iter().collect();
            if node.node_type == PARALLEL_TYPE && targets.len() < 2 {
                diags.push(Diagnostic::warning(
                    format!("Parallel node '{}' has fewer than two outgoing edges", id),
                    Some(node.id.clone()),
                ));
            }
            if reached.contains(id) && targets.is_empty() && !executor.is_output() {
                diags.push(Diagnostic::warning(
                    format!("Node '{}' has no outgoing edges and is not an output node", id),
                    Some(node.id.clone()),
                ));
            }
        }

        // ── Loops ────────────────────────────────────────────────
        let mut reentry: HashSet<(&str, &str)> = HashSet::new();
        for node in nodes.iter().filter(|n| n.node_type == LOOP_TYPE) {
            let head = node.id.as_str();
            let mut body: HashSet<&str> = HashSet::new();
            for start in successors(head) {
                if start != head {
                    body.extend(bfs_distances(start, Some(head), &successors).into_keys());
                }
            }
            for edge in &edges {
                if edge.target == head && (edge.source == head || body.contains(edge.source.as_str())) {
                    reentry.insert((edge.source.as_str(), head));
                }
            }
        }

        // ── Barriers ─────────────────────────────────────────────
        let forward = |id: &str| -> Vec<&str> {
            outgoing
                .get(id)
                .map(|es| {
                    es.iter()
                        .filter(|e| !reentry.contains(&(e.source.as_str(), e.target.as_str())))
                        .map(|e| e.target.as_str())
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut barriers = BTreeMap::new();
        for node in nodes.iter().filter(|n| n.node_type == PARALLEL_TYPE) {
            let fork = node.id.as_str();
            let branches: BTreeSet<&str> = forward(fork).into_iter().collect();
            if branches.len() < 2 {
                continue;
            }
            let distances: Vec<HashMap<&str, usize>> = branches
                .iter()
                .map(|b| bfs_distances(*b, Some(fork), &forward))
                .collect();
            let join = nodes
                .iter()
                .map(|n| n.id.as_str())
                .filter_map(|candidate| {
                    let mut worst = 0;
                    for d in &distances {
                        worst = worst.max(*d.get(candidate)?);
                    }
                    Some((worst, order[candidate], candidate))
                })
                .min();
            if let Some((_, _, join_node)) = join {
                barriers.insert(
                    fork.to_string(),
                    Barrier {
                        join_node: join_node.to_string(),
                        branches: branches.len(),
                    },
                );
            }
        }

        let errors = diags.iter().filter(|d| d.is_error()).count();
        debug!(
            nodes = nodes.len(),
            edges = edges.len(),
            errors,
            warnings = diags.len() - errors,
            "Compiled graph document"
        );

        let ir = match entry {
            Some(entry) if errors == 0 => Some(GraphIr {
                nodes: nodes
                    .iter()
                    .map(|n| GraphIrNode {
                        id: n.id.clone(),
                        node_type: n.node_type.clone(),
                        config: n.config.clone(),
                    })
                    .collect(),
                edges: edges
                    .iter()
                    .map(|e| GraphIrEdge {
                        source: e.source.clone(),
                        target: e.target.clone(),
                        source_handle: e.source_handle.clone(),
                        reentry: reentry.contains(&(e.source.as_str(), e.target.as_str())),
                    })
                    .collect(),
                routing_maps,
                entry_point: entry.to_string(),
                exit_nodes: outputs,
                barriers,
            }),
            _ => None,
        };

        CompileOutput {
            ir,
            diagnostics: diags,
        }
    }
}

/// Breadth-first hop counts from `start`, never entering `stop`.
fn bfs_distances<'a, F>(start: &'a str, stop: Option<&str>, successors: &F) -> HashMap<&'a str, usize>
where
    F: Fn(&'a str) -> Vec<&'a str>,
{
    let mut dist = HashMap::new();
    let mut queue = VecDeque::new();
    dist.insert(start, 0);
    queue.push_back(start);
    while let Some(id) = queue.pop_front() {
        let d = dist[id];
        for next in successors(id) {
            if Some(next) == stop || dist.contains_key(next) {
                continue;
            }
            dist.insert(next, d + 1);
            queue.push_back(next);
        }
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use strand_nodes::BuiltinOptions;
    use strand_test_utils::fixtures::{self, branch, document, edge, node};

    fn compiler() -> GraphCompiler {
        GraphCompiler::new(Arc::new(NodeRegistry::with_builtins(BuiltinOptions::default())))
    }

    fn compile(doc: Value) -> CompileOutput {
        compiler().compile_value(doc).unwrap()
    }

    fn error_for<'a>(out: &'a CompileOutput, node_id: &str) -> Option<&'a Diagnostic> {
        out.errors().find(|d| d.node_id.as_deref() == Some(node_id))
    }

    #[test]
    fn diamond_compiles_cleanly() {
        let out = compile(fixtures::diamond());
        assert_eq!(out.errors().count(), 0, "{:?}", out.diagnostics);

        let ir = out.ir.unwrap();
        assert_eq!(ir.entry_point, "start");
        assert!(ir.is_exit("end"));
        let route = ir.routing("route").unwrap();
        assert_eq!(route.edges["yes"], "left");
        assert_eq!(route.edges["else"], "right");
        assert_eq!(route.default_handle.as_deref(), Some("else"));
        assert!(ir.barriers.is_empty());
    }

    #[test]
    fn orphan_is_an_error() {
        let mut doc = fixtures::passthrough();
        doc["nodes"]
            .as_array_mut()
            .unwrap()
            .push(node("stray", "set_state", json!({"values": {"x": 1}})));

        let out = compile(doc);
        assert!(out.ir.is_none());
        let diag = error_for(&out, "stray").unwrap();
        assert!(diag.message.contains("unreachable"));
    }

    #[test]
    fn sink_orphan_is_only_a_warning() {
        let mut doc = fixtures::passthrough();
        doc["nodes"]
            .as_array_mut()
            .unwrap()
            .push(node("audit", "set_state", json!({"values": {"x": 1}, "sink": true})));

        let out = compile(doc);
        assert!(out.is_ok(), "{:?}", out.diagnostics);
        assert!(out
            .warnings()
            .any(|d| d.node_id.as_deref() == Some("audit")));
    }

    #[test]
    fn notes_may_float() {
        let mut doc = fixtures::passthrough();
        doc["nodes"]
            .as_array_mut()
            .unwrap()
            .push(node("memo", "note", json!({"text": "remember"})));
        assert!(compile(doc).is_ok());
    }

    #[test]
    fn missing_output_node() {
        let out = compile(document(vec![node("start", "start", json!({}))], vec![]));
        let messages: Vec<&str> = out.errors().map(|d| d.message.as_str()).collect();
        assert!(messages.contains(&"Graph must have at least one input/output node"));
    }

    #[test]
    fn two_inputs_rejected() {
        let out = compile(document(
            vec![
                node("a", "start", json!({})),
                node("b", "start", json!({})),
                node("end", "end", json!({})),
            ],
            vec![edge("a", "end"), edge("b", "end")],
        ));
        assert!(out
            .errors()
            .any(|d| d.message.starts_with("Graph must have exactly one input node")));
    }

    #[test]
    fn incomplete_routing_is_an_error() {
        let out = compile(document(
            vec![
                node("start", "start", json!({})),
                node(
                    "route",
                    "if_else",
                    json!({"conditions": [{"name": "yes", "expression": "true"}]}),
                ),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "route"), branch("route", "end", "yes")],
        ));
        let diag = error_for(&out, "route").unwrap();
        assert!(diag.message.contains("missing handle(s): else"), "{}", diag.message);
    }

    #[test]
    fn branch_edge_without_handle_is_an_error() {
        let out = compile(document(
            vec![
                node("start", "start", json!({})),
                node(
                    "route",
                    "if_else",
                    json!({"conditions": [{"name": "yes", "expression": "true"}]}),
                ),
                node("end", "end", json!({})),
            ],
            vec![
                edge("start", "route"),
                edge("route", "end"),
                branch("route", "end", "yes"),
                branch("route", "end", "else"),
            ],
        ));
        assert!(error_for(&out, "route")
            .unwrap()
            .message
            .contains("without a source_handle"));
    }

    #[test]
    fn unbounded_while_is_an_error() {
        let mut doc = fixtures::counting_loop(3);
        doc["nodes"][1]["config"] = json!({"condition": "true"});

        let out = compile(doc);
        let diag = error_for(&out, "loop").unwrap();
        assert!(diag.message.starts_with("max_iterations"));
    }

    #[test]
    fn loop_back_edge_marked_reentry() {
        let ir = compile(fixtures::counting_loop(3)).into_result().unwrap();
        assert!(ir.is_reentry("body", "loop"));
        assert!(!ir.is_reentry("start", "loop"));
        assert_eq!(ir.edges.iter().filter(|e| e.reentry).count(), 1);
    }

    #[test]
    fn fan_out_records_barrier() {
        let ir = compile(fixtures::fan_out()).into_result().unwrap();
        assert_eq!(
            ir.barriers["fan"],
            Barrier {
                join_node: "merge".into(),
                branches: 2
            }
        );
        assert_eq!(ir.barrier_arrivals("merge"), 2);
        assert_eq!(ir.barrier_arrivals("end"), 0);
    }

    #[test]
    fn lone_parallel_branch_warns() {
        let out = compile(document(
            vec![
                node("start", "start", json!({})),
                node("fan", "parallel", json!({})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "fan"), edge("fan", "end")],
        ));
        assert!(out.is_ok());
        assert!(out.warnings().any(|d| d.node_id.as_deref() == Some("fan")));
    }

    #[test]
    fn structural_errors_are_collected_together() {
        let out = compile(document(
            vec![
                node("start", "start", json!({})),
                node("start", "end", json!({})),
                node("mystery", "teleport", json!({})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "end"), edge("start", "ghost"), edge("start", "mystery")],
        ));
        let messages: Vec<&str> = out.errors().map(|d| d.message.as_str()).collect();
        assert!(messages.contains(&"Duplicate node id 'start'"));
        assert!(messages.contains(&"Unknown node type 'teleport'"));
        assert!(messages.iter().any(|m| m.contains("unknown target node 'ghost'")));

        match out.into_result() {
            Err(StrandError::Validation(diags)) => assert!(diags.len() >= 3),
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn orchestration_can_be_switched_off() {
        let doc = document(
            vec![
                node("start", "start", json!({})),
                node("spawn", "spawn_run", json!({"target_agent_id": "worker"})),
                node("end", "end", json!({})),
            ],
            vec![edge("start", "spawn"), edge("spawn", "end")],
        );

        assert!(compile(doc.clone()).is_ok());

        let out = compiler()
            .with_options(CompilerOptions {
                orchestration_enabled: false,
            })
            .compile_value(doc)
            .unwrap();
        assert!(error_for(&out, "spawn")
            .unwrap()
            .message
            .contains("orchestration primitive"));
    }

    #[test]
    fn dense_dag_validates() {
        let count = 120;
        let ids: Vec<String> = (0..count).map(|i| format!("n{}", i)).collect();
        let mut nodes = vec![node(&ids[0], "start", json!({}))];
        for id in &ids[1..count - 1] {
            nodes.push(node(id, "set_state", json!({"values": {"last": format!("'{}'", id)}})));
        }
        nodes.push(node(&ids[count - 1], "end", json!({})));

        let mut edges = Vec::new();
        for i in 0..count {
            for j in (i + 1)..count {
                edges.push(edge(&ids[i], &ids[j]));
            }
        }

        let started = std::time::Instant::now();
        let out = compile(document(nodes, edges));
        assert!(out.is_ok(), "{:?}", out.diagnostics.first());
        assert_eq!(out.ir.unwrap().edges.len(), count * (count - 1) / 2);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
