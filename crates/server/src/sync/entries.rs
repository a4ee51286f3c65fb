// Shapes of the node and edge entries stored in a graph document.
//
// Field names are camelCase because the web client reads the maps directly.

use serde_json::{json, Value};

use cdm_common::types::{Edge, EdgeKind, Node, NodeType};

use super::document::iso_timestamp;
use crate::store::DocumentNodeRow;

const DEFAULT_WIDTH: f64 = 120.0;
const DEFAULT_HEIGHT: f64 = 40.0;

pub fn node_entry(node: &Node) -> Value {
    json!({
        "id": node.id,
        "x": node.x,
        "y": node.y,
        "label": node.label,
        "parentId": node.parent_id,
        "width": node.width,
        "height": node.height,
        "nodeType": node.node_type.as_str(),
        "description": node.description,
        "props": node.props_value(),
        "tags": node.tags,
        "isArchived": node.is_archived,
        "archivedAt": node.archived_at.map(iso_timestamp),
        "approval": node.approval,
        "createdAt": iso_timestamp(node.created_at),
        "updatedAt": iso_timestamp(node.updated_at),
        "metadata": object_or_empty(&node.metadata),
        "mindmapType": "topic",
    })
}

pub fn edge_entry(edge: &Edge) -> Value {
    json!({
        "id": edge.id,
        "source": edge.source_id,
        "target": edge.target_id,
        "type": edge.kind.as_str(),
        "metadata": object_or_empty(&edge.metadata),
    })
}

/// Deterministic id of the edge derived from `child.parent_id`.
pub fn hierarchical_edge_id(parent_id: &str, child_id: &str) -> String {
    format!("edge-{parent_id}-{child_id}")
}

pub fn hierarchical_edge_entry(parent_id: &str, child_id: &str) -> Value {
    json!({
        "id": hierarchical_edge_id(parent_id, child_id),
        "source": parent_id,
        "target": child_id,
        "type": EdgeKind::Hierarchical.as_str(),
        "metadata": { "kind": EdgeKind::Hierarchical.as_str() },
    })
}

/// Endpoints and kind of an edge entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEndpoints {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
}

/// Reads `type`, then `metadata.kind`; entries without either are hierarchical.
pub fn edge_endpoints(entry: &Value) -> Option<EdgeEndpoints> {
    let source = entry.get("source")?.as_str()?.to_owned();
    let target = entry.get("target")?.as_str()?.to_owned();
    let kind = entry
        .get("type")
        .and_then(Value::as_str)
        .and_then(EdgeKind::parse)
        .or_else(|| {
            entry
                .get("metadata")
                .and_then(|metadata| metadata.get("kind"))
                .and_then(Value::as_str)
                .and_then(EdgeKind::parse)
        })
        .unwrap_or_default();
    Some(EdgeEndpoints { source, target, kind })
}

/// Projects a node entry onto the columns the document owns.
pub fn document_node_row(node_id: &str, entry: &Value) -> Option<DocumentNodeRow> {
    let fields = entry.as_object()?;
    let text = |key: &str| fields.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());
    let number = |key: &str, default: f64| {
        fields.get(key).and_then(Value::as_f64).filter(|n| *n != 0.0).unwrap_or(default)
    };

    Some(DocumentNodeRow {
        id: node_id.to_owned(),
        label: text("label").unwrap_or("Untitled").to_owned(),
        node_type: text("nodeType").and_then(NodeType::parse).unwrap_or_default(),
        x: number("x", 0.0),
        y: number("y", 0.0),
        width: number("width", DEFAULT_WIDTH),
        height: number("height", DEFAULT_HEIGHT),
        parent_id: text("parentId").map(str::to_owned),
        description: text("description").map(str::to_owned),
        tags: fields
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default(),
        is_archived: fields.get("isArchived").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn object_or_empty(value: &Value) -> Value {
    if value.is_object() {
        value.clone()
    } else {
        json!({})
    }
}
