//! Persisted trace spans, built from the runtime event stream.

use serde_json::{json, Value};
use tracing::debug;

use strand_core::error::Result;
use strand_core::{EventKind, RuntimeEvent, TraceSpan};

use crate::store::RunStore;

/// Turns span-carrying runtime events into persisted trace spans.
///
/// Starts and ends are upserts keyed by `(run_id, span_id)`, so replayed
/// events never duplicate a span.
#[derive(Clone)]
pub struct TraceRecorder {
    runs: RunStore,
}

impl TraceRecorder {
    pub fn new(runs: RunStore) -> Self {
        Self { runs }
    }

    /// Persist `event` if it opens or closes a span. Returns whether
    /// anything was written.
    pub fn record(&self, event: &RuntimeEvent) -> Result<bool> {
        let Some(span_id) = event.span_id.as_deref() else {
            return Ok(false);
        };
        let span_type = match event.event {
            EventKind::ToolStart | EventKind::ToolEnd => "tool",
            _ => "node",
        };
        let parent = match span_type {
            "tool" => event.parent_ids.first().cloned(),
            _ => None,
        };

        match event.event {
            EventKind::NodeStart | EventKind::ToolStart => {
                let inputs = event
                    .data
                    .get("inputs")
                    .or_else(|| event.data.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| event.data.clone());
                self.runs.start_span(&TraceSpan {
                    run_id: event.run_id.clone(),
                    span_id: span_id.to_string(),
                    parent_span_id: parent,
                    name: event.name.clone(),
                    span_type: span_type.to_string(),
                    inputs,
                    outputs: None,
                    start_time: event.timestamp,
                    end_time: None,
                    metadata: metadata_object(&event.metadata),
                })?;
            }
            EventKind::NodeEnd | EventKind::ToolEnd => {
                let outputs = event
                    .data
                    .get("outputs")
                    .cloned()
                    .unwrap_or_else(|| event.data.clone());
                self.runs.end_span(
                    &event.run_id,
                    span_id,
                    &event.name,
                    span_type,
                    parent.as_deref(),
                    &outputs,
                    event.timestamp,
                )?;
            }
            EventKind::Error => {
                let message = event.data.get("message").cloned().unwrap_or(Value::Null);
                self.runs.end_span(
                    &event.run_id,
                    span_id,
                    &event.name,
                    span_type,
                    None,
                    &json!({"error": message}),
                    event.timestamp,
                )?;
            }
            _ => return Ok(false),
        }
        debug!(run_id = %event.run_id, span_id, event = event.event.as_str(), "Recorded span");
        Ok(true)
    }
}

fn metadata_object(metadata: &Value) -> Value {
    if metadata.is_object() {
        metadata.clone()
    } else {
        json!({})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use strand_core::{RunId, RunRecord};

    use crate::db::Database;

    fn recorder() -> (TraceRecorder, RunStore, RunId) {
        let runs = RunStore::new(Arc::new(Database::in_memory().unwrap()));
        let run = RunRecord::top_level("t1", "agent", "u1", json!(null));
        runs.insert(&run).unwrap();
        (TraceRecorder::new(runs.clone()), runs, run.id)
    }

    #[test]
    fn replayed_events_do_not_duplicate_spans() {
        let (recorder, runs, run_id) = recorder();
        let start = RuntimeEvent::new(EventKind::NodeStart, run_id.clone(), "work")
            .with_span("work#1")
            .with_data(json!({"inputs": {"input": 1}}))
            .with_metadata(json!({"node_type": "tool", "step": 1}));
        let end = RuntimeEvent::new(EventKind::NodeEnd, run_id.clone(), "work")
            .with_span("work#1")
            .with_data(json!({"outputs": {"tool_result": 2}}));

        for event in [&start, &start, &end, &end] {
            assert!(recorder.record(event).unwrap());
        }

        let spans = runs.spans(&run_id).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].inputs, json!({"input": 1}));
        assert_eq!(spans[0].outputs, Some(json!({"tool_result": 2})));
        assert_eq!(spans[0].metadata["node_type"], "tool");
        assert!(spans[0].end_time.is_some());
    }

    #[test]
    fn tool_spans_hang_off_their_node() {
        let (recorder, runs, run_id) = recorder();
        recorder
            .record(
                &RuntimeEvent::new(EventKind::NodeStart, run_id.clone(), "work")
                    .with_span("work#2")
                    .with_data(json!({"inputs": {}})),
            )
            .unwrap();
        recorder
            .record(
                &RuntimeEvent::new(EventKind::ToolStart, run_id.clone(), "search")
                    .with_span("tool:1")
                    .with_data(json!({"arguments": {"q": "x"}}))
                    .with_parents(vec!["work#2".into()]),
            )
            .unwrap();

        let spans = runs.spans(&run_id).unwrap();
        let tool = spans.iter().find(|s| s.span_type == "tool").unwrap();
        let node = spans.iter().find(|s| s.span_type == "node").unwrap();
        assert_eq!(tool.parent_span_id.as_deref(), Some(node.span_id.as_str()));
        assert_eq!(tool.inputs, json!({"q": "x"}));
        assert!(node.parent_span_id.is_none());
    }

    #[test]
    fn events_without_spans_are_skipped() {
        let (recorder, runs, run_id) = recorder();
        let ev = RuntimeEvent::new(EventKind::RunEnd, run_id.clone(), "graph")
            .with_data(json!({"output": 1}));
        assert!(!recorder.record(&ev).unwrap());

        let failed = RuntimeEvent::new(EventKind::Error, run_id.clone(), "work")
            .with_span("work#2")
            .with_data(json!({"message": "kaboom"}));
        assert!(recorder.record(&failed).unwrap());
        let spans = runs.spans(&run_id).unwrap();
        assert_eq!(spans[0].outputs, Some(json!({"error": "kaboom"})));
    }
}
