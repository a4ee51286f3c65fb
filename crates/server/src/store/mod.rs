//! Relational system of record for graphs, nodes and edges.
//!
//! [`GraphStore`] dispatches every operation to PostgreSQL or to an
//! in-process map. The memory backend serves tests and database-less local
//! runs and mirrors the Postgres semantics, including the approval
//! compare-and-swap.

mod memory;
mod postgres;

use std::sync::Arc;

use cdm_common::approval::ApprovalPipeline;
use cdm_common::types::{
    Deliverable, Edge, EdgeKind, Graph, GraphWithRelations, Node, NodeType, TaskStatus,
};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

pub use memory::MemoryGraphStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("graph {0} not found")]
    GraphNotFound(String),
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("stored row {id} is malformed: {reason}")]
    Corrupt { id: String, reason: String },
}

/// The approval projection returned by [`GraphStore::find_nodes_by_ids`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeApproval {
    pub id: String,
    pub approval: Option<ApprovalPipeline>,
}

/// Node columns a live document is allowed to write back.
///
/// Approval and task status are owned by the workflow and never appear here.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentNodeRow {
    pub id: String,
    pub label: String,
    pub node_type: NodeType,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub parent_id: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub is_archived: bool,
}

#[derive(Clone)]
pub enum GraphStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryGraphStore>>),
}

impl GraphStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryGraphStore::default())))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn find_node(&self, node_id: &str) -> Result<Option<Node>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::find_node(pool, node_id).await,
            Self::Memory(store) => Ok(store.read().await.find_node(node_id)),
        }
    }

    /// Replaces the whole pipeline if the row still carries `expected_version`.
    ///
    /// Returns `false` when another writer got there first.
    pub async fn update_approval(
        &self,
        node_id: &str,
        expected_version: i64,
        pipeline: &ApprovalPipeline,
    ) -> Result<bool, StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::update_approval(pool, node_id, expected_version, pipeline).await
            }
            Self::Memory(store) => {
                store.write().await.update_approval(node_id, expected_version, pipeline)
            }
        }
    }

    pub async fn update_task_status(
        &self,
        node_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::update_task_status(pool, node_id, status).await,
            Self::Memory(store) => store.write().await.update_task_status(node_id, status),
        }
    }

    pub async fn update_deliverables(
        &self,
        node_id: &str,
        deliverables: &[Deliverable],
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::update_deliverables(pool, node_id, deliverables).await,
            Self::Memory(store) => store.write().await.update_deliverables(node_id, deliverables),
        }
    }

    pub async fn find_edges_by_source(
        &self,
        source_id: &str,
        kind: EdgeKind,
    ) -> Result<Vec<Edge>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::find_edges_by_source(pool, source_id, kind).await,
            Self::Memory(store) => Ok(store
                .read()
                .await
                .find_edges(|edge| edge.source_id == source_id && edge.kind == kind)),
        }
    }

    pub async fn find_edges_by_target(
        &self,
        target_id: &str,
        kind: EdgeKind,
    ) -> Result<Vec<Edge>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::find_edges_by_target(pool, target_id, kind).await,
            Self::Memory(store) => Ok(store
                .read()
                .await
                .find_edges(|edge| edge.target_id == target_id && edge.kind == kind)),
        }
    }

    /// Unknown ids are omitted from the result.
    pub async fn find_nodes_by_ids(&self, ids: &[String]) -> Result<Vec<NodeApproval>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Self::Postgres(pool) => postgres::find_nodes_by_ids(pool, ids).await,
            Self::Memory(store) => Ok(store.read().await.find_nodes_by_ids(ids)),
        }
    }

    pub async fn update_yjs_state(&self, graph_id: &str, state: &[u8]) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::update_yjs_state(pool, graph_id, state).await,
            Self::Memory(store) => store.write().await.update_yjs_state(graph_id, state),
        }
    }

    pub async fn find_graph_with_relations(
        &self,
        graph_id: &str,
    ) -> Result<Option<GraphWithRelations>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::find_graph_with_relations(pool, graph_id).await,
            Self::Memory(store) => Ok(store.read().await.find_graph_with_relations(graph_id)),
        }
    }

    /// Inserts or updates node rows of `graph_id` from a flushed document.
    ///
    /// Rows that already belong to another graph are left untouched.
    pub async fn upsert_nodes_from_document(
        &self,
        graph_id: &str,
        rows: &[DocumentNodeRow],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        match self {
            Self::Postgres(pool) => postgres::upsert_nodes_from_document(pool, graph_id, rows).await,
            Self::Memory(store) => {
                store.write().await.upsert_nodes_from_document(graph_id, rows);
                Ok(())
            }
        }
    }

    pub async fn insert_graph(&self, graph: Graph) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::insert_graph(pool, &graph).await,
            Self::Memory(store) => {
                store.write().await.insert_graph(graph);
                Ok(())
            }
        }
    }

    pub async fn insert_node(&self, node: Node) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::insert_node(pool, &node).await,
            Self::Memory(store) => {
                store.write().await.insert_node(node);
                Ok(())
            }
        }
    }

    pub async fn insert_edge(&self, edge: Edge) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::insert_edge(pool, &edge).await,
            Self::Memory(store) => {
                store.write().await.insert_edge(edge);
                Ok(())
            }
        }
    }
}
