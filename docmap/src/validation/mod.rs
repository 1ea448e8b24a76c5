//! Structured validation errors: per-attribute message lists that nest for
//! embedded documents.

use std::collections::BTreeMap;

/// Key used for object-level (cross-field) failures raised by a schema's
/// clean hook.
pub const NON_FIELD_ERRORS: &str = "__all__";

/// One failure: a message, or a nested tree from an embedded document.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorNode {
    Message(String),
    Nested(ErrorTree),
}

/// Validation failures grouped by attribute name. Every failing attribute is
/// present with every failure recorded against it, so a caller can fix a
/// whole form in one pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorTree {
    entries: BTreeMap<String, Vec<ErrorNode>>,
}

impl ErrorTree {
    pub fn new() -> ErrorTree {
        ErrorTree::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_message(&mut self, attr: &str, message: impl Into<String>) {
        self.push_node(attr, ErrorNode::Message(message.into()));
    }

    pub fn push_node(&mut self, attr: &str, node: ErrorNode) {
        self.entries.entry(attr.to_string()).or_default().push(node);
    }

    pub fn merge(&mut self, other: ErrorTree) {
        for (attr, nodes) in other.entries {
            self.entries.entry(attr).or_default().extend(nodes);
        }
    }

    pub fn attrs(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn nodes_for(&self, attr: &str) -> &[ErrorNode] {
        self.entries.get(attr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The plain messages recorded against an attribute (nested trees are
    /// not flattened; see `nested_for`).
    pub fn messages_for(&self, attr: &str) -> Vec<&str> {
        self.nodes_for(attr)
            .iter()
            .filter_map(|node| match node {
                ErrorNode::Message(msg) => Some(msg.as_str()),
                ErrorNode::Nested(_) => None,
            })
            .collect()
    }

    pub fn nested_for(&self, attr: &str) -> Vec<&ErrorTree> {
        self.nodes_for(attr)
            .iter()
            .filter_map(|node| match node {
                ErrorNode::Nested(tree) => Some(tree),
                ErrorNode::Message(_) => None,
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(attr, nodes)| {
                let items: Vec<serde_json::Value> = nodes
                    .iter()
                    .map(|node| match node {
                        ErrorNode::Message(msg) => serde_json::Value::String(msg.clone()),
                        ErrorNode::Nested(tree) => tree.to_json(),
                    })
                    .collect();
                (attr.clone(), serde_json::Value::Array(items))
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl serde::Serialize for ErrorTree {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.to_json(), serializer)
    }
}

impl std::fmt::Display for ErrorTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
