// Core graph domain types shared across all CDM crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::approval::ApprovalPipeline;

/// Prefix of every replicated document name: `graph:{graph_id}`.
pub const GRAPH_DOCUMENT_PREFIX: &str = "graph:";

pub fn document_name(graph_id: &str) -> String {
    format!("{GRAPH_DOCUMENT_PREFIX}{graph_id}")
}

/// Inverse of [`document_name`]. Returns `None` for names outside the `graph:` namespace.
pub fn graph_id_from_document_name(name: &str) -> Option<&str> {
    name.strip_prefix(GRAPH_DOCUMENT_PREFIX).filter(|graph_id| !graph_id.is_empty())
}

/// Selects which extension row applies to a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    #[default]
    Ordinary,
    Task,
    Requirement,
    Pbs,
    Data,
    App,
}

impl NodeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ordinary => "ORDINARY",
            Self::Task => "TASK",
            Self::Requirement => "REQUIREMENT",
            Self::Pbs => "PBS",
            Self::Data => "DATA",
            Self::App => "APP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ORDINARY" => Some(Self::Ordinary),
            "TASK" => Some(Self::Task),
            "REQUIREMENT" => Some(Self::Requirement),
            "PBS" => Some(Self::Pbs),
            "DATA" => Some(Self::Data),
            "APP" => Some(Self::App),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural classification of an edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Parent → child containment, derivable from `Node::parent_id`.
    #[default]
    Hierarchical,
    /// Prerequisite gating a successor task's readiness.
    Dependency,
}

impl EdgeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hierarchical => "hierarchical",
            Self::Dependency => "dependency",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hierarchical" => Some(Self::Hierarchical),
            "dependency" => Some(Self::Dependency),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "todo" => Some(Self::Todo),
            "in-progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file attached to a task as evidence for approval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Deliverable {
    pub id: String,
    pub file_id: String,
    pub file_name: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Task extension row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deliverables: Vec<Deliverable>,
}

/// Relational node row together with its type-specific extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub graph_id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub parent_id: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
    pub approval: Option<ApprovalPipeline>,
    /// Compare-and-swap token for `approval`; bumped on every pipeline write.
    #[serde(default)]
    pub approval_version: i64,
    pub task_props: Option<TaskProps>,
    /// Requirement / PBS / Data / App extension payload.
    pub extension_props: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A bare node with default geometry, used by seeders and tests.
    pub fn new(id: impl Into<String>, graph_id: impl Into<String>, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            graph_id: graph_id.into(),
            label: label.into(),
            node_type: NodeType::Ordinary,
            x: 0.0,
            y: 0.0,
            width: 120.0,
            height: 40.0,
            parent_id: None,
            description: None,
            tags: Vec::new(),
            is_archived: false,
            archived_at: None,
            metadata: Value::Object(Map::new()),
            approval: None,
            approval_version: 0,
            task_props: None,
            extension_props: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn as_task(mut self, props: TaskProps) -> Self {
        self.node_type = NodeType::Task;
        self.task_props = Some(props);
        self
    }

    pub fn is_task(&self) -> bool {
        self.node_type == NodeType::Task
    }

    pub fn deliverables(&self) -> &[Deliverable] {
        self.task_props.as_ref().map(|props| props.deliverables.as_slice()).unwrap_or(&[])
    }

    /// Flattens whichever extension row applies into one JSON object.
    pub fn props_value(&self) -> Value {
        if let Some(task) = &self.task_props {
            return serde_json::to_value(task).unwrap_or_else(|_| Value::Object(Map::new()));
        }
        self.extension_props.clone().unwrap_or_else(|| Value::Object(Map::new()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub graph_id: String,
    pub source_id: String,
    pub target_id: String,
    pub kind: EdgeKind,
    #[serde(default)]
    pub metadata: Value,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        graph_id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        kind: EdgeKind,
    ) -> Self {
        Self {
            id: id.into(),
            graph_id: graph_id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
            metadata: serde_json::json!({ "kind": kind.as_str() }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data: Value,
    /// Last flushed merged document snapshot.
    #[serde(skip)]
    pub yjs_state: Option<Vec<u8>>,
    pub updated_at: DateTime<Utc>,
}

impl Graph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data: Value::Object(Map::new()),
            yjs_state: None,
            updated_at: Utc::now(),
        }
    }

    pub fn layout_mode(&self) -> Option<&str> {
        self.data.get("layoutMode").and_then(Value::as_str)
    }
}

/// A graph together with its relational decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphWithRelations {
    pub graph: Graph,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}
