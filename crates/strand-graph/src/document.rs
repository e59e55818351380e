//! The authoring-time graph document, as saved by an editor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::error::Result;

/// Canvas coordinates. Carried through unchanged; the compiler ignores them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub config: Value,
}

impl DocumentNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            position: Position::default(),
            config: Value::Object(Default::default()),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Nodes marked `sink` may be unreachable without failing compilation.
    pub fn is_sink(&self) -> bool {
        self.config
            .get("sink")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl DocumentEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<DocumentNode>,
    #[serde(default)]
    pub edges: Vec<DocumentEdge>,
}

impl GraphDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_node(mut self, node: DocumentNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: DocumentEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn node(&self, id: &str) -> Option<&DocumentNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_editor_json() {
        let doc = GraphDocument::from_value(json!({
            "nodes": [
                {"id": "start", "type": "start", "position": {"x": 10, "y": 20}},
                {"id": "end", "type": "end", "config": {"output": "input"}}
            ],
            "edges": [{"id": "e1", "source": "start", "target": "end", "sourceHandle": "out"}]
        }))
        .unwrap();

        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[0].position, Position { x: 10.0, y: 20.0 });
        assert!(doc.nodes[0].config.is_null());
        assert_eq!(doc.edges[0].source_handle.as_deref(), Some("out"));
        assert_eq!(doc.node("end").unwrap().node_type, "end");
    }

    #[test]
    fn builder_matches_parsed_form() {
        let built = GraphDocument::new()
            .with_node(DocumentNode::new("start", "start"))
            .with_node(DocumentNode::new("end", "end").with_config(json!({"sink": true})))
            .with_edge(DocumentEdge::new("start", "end"));

        assert_eq!(built.edges[0].id, "start->end");
        assert!(built.node("end").unwrap().is_sink());
        assert!(!built.node("start").unwrap().is_sink());
    }
}
