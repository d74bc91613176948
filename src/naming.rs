//! Membership updates handed to the consumer of a watcher.

use crate::registry::NodeData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Add,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub op: Operation,
    /// Node id, the registered key without the service prefix
    #[serde(rename = "address")]
    pub addr: String,
    /// Present only for `Add`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NodeData>,
}

impl Update {
    pub fn add(addr: impl Into<String>, metadata: NodeData) -> Self {
        Self {
            op: Operation::Add,
            addr: addr.into(),
            metadata: Some(metadata),
        }
    }

    pub fn delete(addr: impl Into<String>) -> Self {
        Self {
            op: Operation::Delete,
            addr: addr.into(),
            metadata: None,
        }
    }
}

/// Consumer-side view of the registered nodes, built only from update batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    nodes: HashMap<String, NodeData>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, updates: &[Update]) {
        for update in updates {
            match update.op {
                Operation::Add => {
                    let metadata = update.metadata.clone().unwrap_or_default();
                    self.nodes.insert(update.addr.clone(), metadata);
                }
                Operation::Delete => {
                    if self.nodes.remove(&update.addr).is_none() {
                        warn!(addr = %update.addr, "Delete for unknown node");
                    }
                }
            }
        }
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.nodes.contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<&NodeData> {
        self.nodes.get(addr)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registered addresses, sorted.
    pub fn addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.nodes.keys().cloned().collect();
        addrs.sort();
        addrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(k: &str, v: &str) -> NodeData {
        NodeData::from([(k.to_string(), v.to_string())])
    }

    #[test]
    fn test_membership_apply() {
        let mut membership = Membership::new();
        membership.apply(&[
            Update::add("127.0.0.1:8000", data("foo", "bar")),
            Update::add("127.0.0.1:8001", data("foo", "baz")),
        ]);
        assert_eq!(membership.addrs(), vec!["127.0.0.1:8000", "127.0.0.1:8001"]);

        membership.apply(&[
            Update::delete("127.0.0.1:8000"),
            Update::add("127.0.0.1:8001", data("foo", "qux")),
        ]);
        assert_eq!(membership.len(), 1);
        assert!(!membership.contains("127.0.0.1:8000"));
        assert_eq!(membership.get("127.0.0.1:8001"), Some(&data("foo", "qux")));

        // Deleting an unknown node leaves the view untouched.
        membership.apply(&[Update::delete("127.0.0.1:9999")]);
        assert_eq!(membership.len(), 1);
    }

    #[test]
    fn test_update_json_shape() {
        let json = serde_json::to_string(&Update::delete("n1")).unwrap();
        assert_eq!(json, r#"{"op":"Delete","address":"n1"}"#);

        let update: Update =
            serde_json::from_str(r#"{"op":"Add","address":"n1","metadata":{"foo":"bar"}}"#).unwrap();
        assert_eq!(update, Update::add("n1", data("foo", "bar")));
    }
}
