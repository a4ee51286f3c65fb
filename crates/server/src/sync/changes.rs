// Detects which node entries of a live document actually changed.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sha2::{Digest, Sha256};

use cdm_common::events::{ChangeType, NodeChanged};

/// Remembers a fingerprint of `label`, `metadata` and `props` per node.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    fingerprints: HashMap<String, Observed>,
}

#[derive(Debug)]
struct Observed {
    fingerprint: [u8; 32],
    name: String,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares `entries` against the previous observation.
    ///
    /// Nodes seen for the first time are recorded without an event.
    pub fn observe(&mut self, graph_id: &str, entries: &[(String, Value)]) -> Vec<NodeChanged> {
        let mut changes = Vec::new();

        for (node_id, entry) in entries {
            if !entry.is_object() {
                continue;
            }
            let observed = Observed { fingerprint: fingerprint(entry), name: node_name(entry) };
            let current = observed.fingerprint;
            match self.fingerprints.insert(node_id.clone(), observed) {
                Some(previous) if previous.fingerprint != current => changes.push(NodeChanged {
                    graph_id: graph_id.to_owned(),
                    node_id: node_id.clone(),
                    node_name: node_name(entry),
                    change_type: ChangeType::Update,
                }),
                _ => {}
            }
        }

        let present: HashSet<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
        let removed: Vec<String> = self
            .fingerprints
            .keys()
            .filter(|node_id| !present.contains(node_id.as_str()))
            .cloned()
            .collect();
        for node_id in removed {
            if let Some(previous) = self.fingerprints.remove(&node_id) {
                changes.push(NodeChanged {
                    graph_id: graph_id.to_owned(),
                    node_id,
                    node_name: previous.name,
                    change_type: ChangeType::Delete,
                });
            }
        }

        changes
    }

    pub fn tracked(&self) -> usize {
        self.fingerprints.len()
    }
}

fn node_name(entry: &Value) -> String {
    entry
        .get("label")
        .and_then(Value::as_str)
        .filter(|label| !label.is_empty())
        .unwrap_or("Unknown")
        .to_owned()
}

fn fingerprint(entry: &Value) -> [u8; 32] {
    let empty = Value::Object(Default::default());
    let mut hasher = Sha256::new();
    hasher.update(node_name(entry).as_bytes());
    hasher.update(b"|");
    hasher.update(entry.get("metadata").unwrap_or(&empty).to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(entry.get("props").unwrap_or(&empty).to_string().as_bytes());
    hasher.finalize().into()
}
