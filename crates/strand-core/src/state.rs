use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A node's contribution to run state.
pub type StateUpdate = Map<String, Value>;

/// The run input, as handed to `start`.
pub const INPUT_KEY: &str = "input";
/// Per-`while`-node iteration counters.
pub const LOOP_COUNTERS_KEY: &str = "loop_counters";
/// Per-node outputs, keyed by node id.
pub const NODE_OUTPUTS_KEY: &str = "node_outputs";
/// Final run output, written by output nodes.
pub const OUTPUT_KEY: &str = "output";

/// Shared state of one graph invocation.
///
/// Top-level keys are overwritten by updates, except `loop_counters` and
/// `node_outputs`, which merge per sub-key. A `null` sub-value removes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphState {
    values: Map<String, Value>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State seeded with the run input.
    pub fn with_input(input: Value) -> Self {
        let mut state = Self::new();
        state.values.insert(INPUT_KEY.into(), input);
        state
    }

    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Resolve a dotted path (`a.b.0.c`); a leading `state.` is optional.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let path = path.strip_prefix("state.").unwrap_or(path);
        let mut parts = path.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn input(&self) -> &Value {
        self.values.get(INPUT_KEY).unwrap_or(&Value::Null)
    }

    pub fn loop_counter(&self, node_id: &str) -> Option<u64> {
        self.values
            .get(LOOP_COUNTERS_KEY)
            .and_then(|c| c.get(node_id))
            .and_then(Value::as_u64)
    }

    /// Bump a while-node counter; absent counts as zero.
    pub fn increment_loop_counter(&mut self, node_id: &str) -> u64 {
        let next = self.loop_counter(node_id).unwrap_or(0) + 1;
        let counters = self
            .values
            .entry(LOOP_COUNTERS_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !counters.is_object() {
            *counters = Value::Object(Map::new());
        }
        if let Value::Object(map) = counters {
            map.insert(node_id.to_string(), Value::from(next));
        }
        next
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.values.get(NODE_OUTPUTS_KEY).and_then(|o| o.get(node_id))
    }

    pub fn record_node_output(&mut self, node_id: &str, output: Value) {
        let mut update = StateUpdate::new();
        let mut outputs = Map::new();
        outputs.insert(node_id.to_string(), output);
        update.insert(NODE_OUTPUTS_KEY.into(), Value::Object(outputs));
        self.merge(update);
    }

    /// Apply a node's update.
    pub fn merge(&mut self, update: StateUpdate) {
        for (key, value) in update {
            if key == LOOP_COUNTERS_KEY || key == NODE_OUTPUTS_KEY {
                self.merge_nested(key, value);
            } else {
                self.values.insert(key, value);
            }
        }
    }

    fn merge_nested(&mut self, key: String, value: Value) {
        let Value::Object(incoming) = value else {
            self.values.insert(key, value);
            return;
        };
        let target = self
            .values
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        if !target.is_object() {
            *target = Value::Object(Map::new());
        }
        if let Value::Object(map) = target {
            for (sub_key, sub_value) in incoming {
                if sub_value.is_null() {
                    map.remove(&sub_key);
                } else {
                    map.insert(sub_key, sub_value);
                }
            }
        }
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }
}
