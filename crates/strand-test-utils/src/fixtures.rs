//! Graph documents used across crates, in authoring JSON form.

use serde_json::{json, Value};

pub fn node(id: &str, node_type: &str, config: Value) -> Value {
    json!({"id": id, "type": node_type, "position": {"x": 0, "y": 0}, "config": config})
}

pub fn edge(source: &str, target: &str) -> Value {
    json!({"id": format!("{}->{}", source, target), "source": source, "target": target})
}

pub fn branch(source: &str, target: &str, handle: &str) -> Value {
    json!({
        "id": format!("{}-{}->{}", source, handle, target),
        "source": source,
        "target": target,
        "source_handle": handle
    })
}

pub fn document(nodes: Vec<Value>, edges: Vec<Value>) -> Value {
    json!({"nodes": nodes, "edges": edges})
}

/// `start -> route -> {left, right} -> end`, routing on `contains(input, "yes")`.
pub fn diamond() -> Value {
    document(
        vec![
            node("start", "start", json!({})),
            node(
                "route",
                "if_else",
                json!({"conditions": [{"name": "yes", "expression": "contains(input, \"yes\")"}]}),
            ),
            node("left", "set_state", json!({"values": {"branch": "'left'"}})),
            node("right", "set_state", json!({"values": {"branch": "'right'"}})),
            node("end", "end", json!({})),
        ],
        vec![
            edge("start", "route"),
            branch("route", "left", "yes"),
            branch("route", "right", "else"),
            edge("left", "end"),
            edge("right", "end"),
        ],
    )
}

/// A bounded loop whose condition never turns false.
pub fn counting_loop(max_iterations: u64) -> Value {
    document(
        vec![
            node("start", "start", json!({})),
            node("loop", "while", json!({"condition": "true", "max_iterations": max_iterations})),
            node("body", "set_state", json!({"values": {"iterations": "default(iterations, 0) + 1"}})),
            node("end", "end", json!({"output": {"iterations": "iterations"}})),
        ],
        vec![
            edge("start", "loop"),
            branch("loop", "body", "loop"),
            edge("body", "loop"),
            branch("loop", "end", "exit"),
        ],
    )
}

/// `start -> fan -> {a, b} -> merge -> end`.
pub fn fan_out() -> Value {
    document(
        vec![
            node("start", "start", json!({})),
            node("fan", "parallel", json!({})),
            node("a", "set_state", json!({"values": {"a": 1}})),
            node("b", "set_state", json!({"values": {"b": 2}})),
            node("merge", "transform", json!({"mappings": {"sum": "a + b"}})),
            node("end", "end", json!({"output": "sum"})),
        ],
        vec![
            edge("start", "fan"),
            edge("fan", "a"),
            edge("fan", "b"),
            edge("a", "merge"),
            edge("b", "merge"),
            edge("merge", "end"),
        ],
    )
}

/// `start -> gate -> {approved: ship, rejected: hold} -> end`.
pub fn approval_gate() -> Value {
    document(
        vec![
            node("start", "start", json!({})),
            node("gate", "approval", json!({"prompt": "Ship {{ input }}?"})),
            node("ship", "set_state", json!({"values": {"decision": "'shipped'"}})),
            node("hold", "set_state", json!({"values": {"decision": "'held'"}})),
            node("end", "end", json!({"output": "decision"})),
        ],
        vec![
            edge("start", "gate"),
            branch("gate", "ship", "approved"),
            branch("gate", "hold", "rejected"),
            edge("ship", "end"),
            edge("hold", "end"),
        ],
    )
}

/// `start -> end`.
pub fn passthrough() -> Value {
    document(
        vec![
            node("start", "start", json!({})),
            node("end", "end", json!({"output": "input"})),
        ],
        vec![edge("start", "end")],
    )
}

/// `start -> work -> end`, where `work` calls `tool_id`.
pub fn single_tool(tool_id: &str) -> Value {
    document(
        vec![
            node("start", "start", json!({})),
            node("work", "tool", json!({"tool_id": tool_id, "arguments": {"input": "input"}})),
            node("end", "end", json!({"output": "tool_result"})),
        ],
        vec![edge("start", "work"), edge("work", "end")],
    )
}
