use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use strand_core::orchestration::AllowlistEntry;
use strand_core::traits::Orchestrator;
use strand_core::{AppConfig, EventKind, RunStatus, StrandError};
use strand_exec::{AgentDefinition, Platform, StartRun};
use strand_graph::GraphDocument;
use strand_test_utils::fixtures::{self, document, edge, node};
use strand_test_utils::ScriptedCapabilities;

const WAIT: Duration = Duration::from_secs(10);

fn platform(config: AppConfig) -> (Platform, Arc<ScriptedCapabilities>) {
    let caps = Arc::new(ScriptedCapabilities::new());
    caps.set_slow_tool("slow", Duration::from_secs(60));
    let platform = Platform::builder(config)
        .with_capabilities(caps.clone())
        .in_memory()
        .build()
        .expect("build platform");
    (platform, caps)
}

fn deploy(platform: &Platform, id: &str, doc: Value) -> Result<(), StrandError> {
    let doc = GraphDocument::from_value(doc)?;
    platform
        .service
        .deploy_agent(AgentDefinition::new("acme", id), &doc)
        .map(|_| ())
}

fn allow(platform: &Platform, orchestrator: &str, target: &str) {
    platform
        .orchestration_store()
        .add_allowlist_entry(&AllowlistEntry::for_agent("acme", orchestrator, target))
        .unwrap();
}

/// `start -> fan (spawn_group over two echo children) -> gather (join) -> end`.
fn fan_out_orchestrator() -> Value {
    document(
        vec![
            node("start", "start", json!({})),
            node(
                "fan",
                "spawn_group",
                json!({
                    "targets": [
                        {"target_agent_id": "echo", "input": "input.a"},
                        {"target_agent_id": "echo", "input": "input.b"},
                    ],
                    "join_mode": "all",
                }),
            ),
            node("gather", "join", json!({"group_id": "group_id"})),
            node("end", "end", json!({"output": "join"})),
        ],
        vec![edge("start", "fan"), edge("fan", "gather"), edge("gather", "end")],
    )
}

#[tokio::test]
async fn diamond_graph_runs_end_to_end() {
    let (platform, _) = platform(AppConfig::default());
    deploy(&platform, "diamond", fixtures::diamond()).unwrap();

    let run = platform
        .service
        .start_run(StartRun::new("acme", "diamond", "alice", json!("yes")))
        .unwrap();
    let done = platform.service.wait(&run.id, WAIT).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    let spans = platform.service.spans(&run.id).unwrap();
    assert!(!spans.is_empty());
    assert!(spans.iter().all(|s| s.end_time.is_some()));
}

#[tokio::test]
async fn graph_orchestrator_fans_out_and_joins() {
    let (platform, _) = platform(AppConfig::default());
    deploy(&platform, "echo", fixtures::passthrough()).unwrap();
    deploy(&platform, "orch", fan_out_orchestrator()).unwrap();
    allow(&platform, "orch", "echo");
    let mut events = platform.bus.subscribe();

    let run = platform
        .service
        .start_run(StartRun::new("acme", "orch", "alice", json!({"a": "left", "b": "right"})))
        .unwrap();
    let done = platform.service.wait(&run.id, WAIT).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error_message);

    let join = done.output_result.unwrap();
    assert_eq!(join["status"], "completed");
    assert_eq!(join["success_count"], 2);
    let outputs: Vec<&Value> = join["members"].as_array().unwrap().iter().map(|m| &m["output"]).collect();
    assert_eq!(outputs, vec![&json!("left"), &json!("right")]);

    let tree = platform.lineage().query_tree(&run.id).unwrap();
    assert_eq!(tree.node_count, 3);
    assert_eq!(tree.tree.children.len(), 2);
    for child in &tree.tree.children {
        assert_eq!(child.depth, 1);
        assert_eq!(child.status, RunStatus::Completed);
        assert!(child.membership.is_some());
    }

    let mut spawns = 0;
    let mut lifecycle = 0;
    while let Ok(ev) = events.try_recv() {
        if ev.run_id != run.id {
            continue;
        }
        match ev.event {
            EventKind::SpawnDecision => spawns += 1,
            EventKind::ChildLifecycle => lifecycle += 1,
            _ => {}
        }
    }
    assert_eq!(spawns, 2);
    assert!(lifecycle >= 2);
}

#[tokio::test]
async fn oversized_group_timeout_still_joins() {
    let (platform, _) = platform(AppConfig::default());
    let mut orchestrator = fan_out_orchestrator();
    orchestrator["nodes"][1]["config"]["timeout_s"] = json!(i64::MAX as u64);
    deploy(&platform, "echo", fixtures::passthrough()).unwrap();
    deploy(&platform, "orch", orchestrator).unwrap();
    allow(&platform, "orch", "echo");

    let run = platform
        .service
        .start_run(StartRun::new("acme", "orch", "alice", json!({"a": 1, "b": 2})))
        .unwrap();
    let done = platform.service.wait(&run.id, WAIT).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed, "{:?}", done.error_message);
    assert_eq!(done.output_result.unwrap()["success_count"], 2);
}

#[tokio::test]
async fn tool_spans_point_at_their_node_span() {
    let (platform, caps) = platform(AppConfig::default());
    caps.set_tool("search", json!({"hits": 1}));
    deploy(&platform, "searcher", fixtures::single_tool("search")).unwrap();

    let run = platform
        .service
        .start_run(StartRun::new("acme", "searcher", "alice", json!("q")))
        .unwrap();
    let done = platform.service.wait(&run.id, WAIT).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    let spans = platform.service.spans(&run.id).unwrap();
    let tool = spans.iter().find(|s| s.span_type == "tool").unwrap();
    let parent = tool.parent_span_id.as_deref().unwrap();
    let node = spans.iter().find(|s| s.span_id == parent).unwrap();
    assert_eq!(node.name, "work");
    assert_eq!(node.span_type, "node");
}

#[tokio::test]
async fn unlisted_target_fails_the_orchestrator_run() {
    let (platform, _) = platform(AppConfig::default());
    deploy(&platform, "echo", fixtures::passthrough()).unwrap();
    deploy(&platform, "orch", fan_out_orchestrator()).unwrap();

    let run = platform
        .service
        .start_run(StartRun::new("acme", "orch", "alice", json!({"a": 1, "b": 2})))
        .unwrap();
    let done = platform.service.wait(&run.id, WAIT).await.unwrap();
    assert_eq!(done.status, RunStatus::Failed);
    assert!(done.error_message.unwrap().contains("allow-listed"));
    assert_eq!(platform.service.count_children(&run.id).unwrap(), 0);
}

#[tokio::test]
async fn disabled_primitives_reject_orchestrator_graphs() {
    let mut config = AppConfig::default();
    config.orchestration.graph_primitives_enabled = false;
    let (platform, _) = platform(config);

    let err = deploy(&platform, "orch", fan_out_orchestrator()).unwrap_err();
    assert!(matches!(err, StrandError::Validation(_)));
    deploy(&platform, "echo", fixtures::passthrough()).unwrap();
}

#[tokio::test]
async fn cancelling_a_root_takes_its_children_down() {
    let (platform, _) = platform(AppConfig::default());
    deploy(&platform, "slow", fixtures::single_tool("slow")).unwrap();
    deploy(
        &platform,
        "orch",
        document(
            vec![
                node("start", "start", json!({})),
                node("spawn", "spawn_run", json!({"target_agent_id": "slow"})),
                node("gate", "approval", json!({"prompt": "continue?"})),
                node("end", "end", json!({"output": "spawned_run_id"})),
            ],
            vec![edge("start", "spawn"), edge("spawn", "gate"), edge("gate", "end")],
        ),
    )
    .unwrap();
    allow(&platform, "orch", "slow");

    let run = platform
        .service
        .start_run(StartRun::new("acme", "orch", "alice", json!(null)))
        .unwrap();
    let paused = platform.service.wait(&run.id, WAIT).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    let children = platform.service.children(&run.id).unwrap();
    assert_eq!(children.len(), 1);

    let outcome = platform
        .kernel
        .cancel_subtree(run.id.clone(), run.id.clone())
        .await
        .unwrap();
    assert_eq!(outcome.cancelled_run_ids, vec![run.id.clone(), children[0].id.clone()]);

    let child = platform.service.wait(&children[0].id, WAIT).await.unwrap();
    assert_eq!(child.status, RunStatus::Cancelled);
    assert_eq!(
        platform.service.get_run(&run.id).unwrap().status,
        RunStatus::Cancelled
    );
}
