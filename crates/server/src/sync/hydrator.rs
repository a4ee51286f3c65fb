//! Builds a graph document from the relational store on first open.

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use cdm_common::types::{GraphWithRelations, Node, TaskStatus};

use super::document::{GraphDocument, GraphWriter};
use super::entries::{edge_endpoints, edge_entry, hierarchical_edge_entry, hierarchical_edge_id, node_entry};
use crate::store::{GraphStore, StoreError};

#[derive(Debug, Error)]
pub enum HydrateError {
    #[error("graph {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("stored snapshot for graph {graph_id} is unreadable: {source}")]
    Snapshot {
        graph_id: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone)]
pub struct DocumentHydrator {
    store: GraphStore,
}

impl DocumentHydrator {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// Loads the stored snapshot when there is one, otherwise projects rows.
    ///
    /// Approval and task status are always taken from the relational rows.
    pub async fn hydrate(&self, graph_id: &str) -> Result<GraphDocument, HydrateError> {
        let relations = self
            .store
            .find_graph_with_relations(graph_id)
            .await?
            .ok_or_else(|| HydrateError::NotFound(graph_id.to_owned()))?;

        let document = GraphDocument::new();
        match relations.graph.yjs_state.as_deref() {
            Some(state) if !state.is_empty() => {
                document.apply_update(state).map_err(|source| HydrateError::Snapshot {
                    graph_id: graph_id.to_owned(),
                    source,
                })?;
                let overlaid = overlay_workflow_state(&document, &relations.nodes);
                info!(graph_id, snapshot_bytes = state.len(), overlaid, "hydrated graph document from snapshot");
            }
            _ => {
                let synthesized = project_relations(&document, &relations);
                info!(
                    graph_id,
                    nodes = relations.nodes.len(),
                    edges = relations.edges.len(),
                    synthesized,
                    "hydrated graph document from relational rows"
                );
            }
        }

        Ok(document)
    }
}

/// Writes nodes, edges, synthesized hierarchy and meta in one transaction.
///
/// Returns the number of synthesized hierarchical edges.
pub fn project_relations(document: &GraphDocument, relations: &GraphWithRelations) -> usize {
    let mut synthesized = 0;
    document.write(|writer| {
        for node in &relations.nodes {
            writer.set_node(&node.id, &node_entry(node));
        }
        for edge in &relations.edges {
            writer.set_edge(&edge.id, &edge_entry(edge));
        }
        synthesized = synthesize_hierarchical_edges(writer, &relations.nodes);
        if let Some(layout_mode) = relations.graph.data.get("layoutMode").filter(|v| !v.is_null()) {
            writer.set_meta("layoutMode", layout_mode);
        }
    });
    synthesized
}

/// Adds `edge-{parent}-{child}` for every parent pointer not already covered.
///
/// Any edge already running from the parent to the child suppresses
/// synthesis, whatever its id or kind. Parents missing from `nodes` get no edge.
pub fn synthesize_hierarchical_edges(writer: &mut GraphWriter<'_>, nodes: &[Node]) -> usize {
    let node_ids: HashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
    let mut existing: HashSet<(String, String)> = writer
        .edges()
        .iter()
        .filter_map(|(_, entry)| edge_endpoints(entry))
        .map(|endpoints| (endpoints.source, endpoints.target))
        .collect();

    let mut created = 0;
    for node in nodes {
        let Some(parent_id) = node.parent_id.as_deref() else {
            continue;
        };
        if !node_ids.contains(parent_id) {
            continue;
        }
        if !existing.insert((parent_id.to_owned(), node.id.clone())) {
            continue;
        }
        let edge_id = hierarchical_edge_id(parent_id, &node.id);
        writer.set_edge(&edge_id, &hierarchical_edge_entry(parent_id, &node.id));
        created += 1;
    }
    created
}

/// Re-applies relational approval and task status onto entries already in
/// the document. A snapshot flushed before a workflow write cannot win.
///
/// Returns how many entries changed. Missing entries are not created.
pub fn overlay_workflow_state(document: &GraphDocument, nodes: &[Node]) -> usize {
    let mut changed = 0;
    document.write(|writer| {
        for node in nodes {
            let Some(Value::Object(mut entry)) = writer.node(&node.id) else {
                continue;
            };
            let mut dirty = false;

            let approval = serde_json::to_value(&node.approval).unwrap_or(Value::Null);
            if entry.get("approval") != Some(&approval) {
                entry.insert("approval".into(), approval);
                dirty = true;
            }

            let status = node.task_props.as_ref().and_then(|props| props.status);
            if let Some(status) = status {
                dirty |= overlay_task_status(&mut entry, status);
            }

            if dirty {
                writer.set_node(&node.id, &Value::Object(entry));
                changed += 1;
            }
        }
    });
    changed
}

fn overlay_task_status(entry: &mut serde_json::Map<String, Value>, status: TaskStatus) -> bool {
    let status = Value::String(status.as_str().to_owned());
    let props = entry.entry("props").or_insert_with(|| Value::Object(Default::default()));
    if !props.is_object() {
        *props = Value::Object(Default::default());
    }
    match props {
        Value::Object(props) if props.get("status") != Some(&status) => {
            props.insert("status".into(), status);
            true
        }
        _ => false,
    }
}
